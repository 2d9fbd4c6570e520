//! RPC-style operations exposed over signaling
//!
//! Service calls proxy straight to the bus, introspection snapshots the
//! discovery directory, and file transfer downloads a URL into the upload
//! directory and reports where it landed.

use crate::Result;
use robolink_core::bus::BusConnection;
use robolink_core::directory::TopicDirectory;
use serde_json::{json, Value};
use std::path::Path;
use tracing::info;

/// Invoke a bus service and return its raw reply.
pub async fn call_service(
    bus: &dyn BusConnection,
    service: &str,
    request: Value,
) -> Result<Value> {
    info!("Service call: {}", service);
    Ok(bus.call_service(service, request).await?)
}

/// Snapshot the directory as a topic name to message type map.
pub async fn introspect(directory: &dyn TopicDirectory) -> Value {
    let mut topics = serde_json::Map::new();
    for (topic, info) in directory.list().await {
        topics.insert(topic, Value::String(info.msg_type));
    }
    json!({ "topics": topics })
}

/// Download `url` into `upload_dir` and return `{name, path, size}`.
pub async fn download_file(
    http: &reqwest::Client,
    upload_dir: &Path,
    url: &str,
) -> Result<Value> {
    let name = file_name_from_url(url);
    info!("Downloading {} as {}", url, name);

    let response = http.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;

    tokio::fs::create_dir_all(upload_dir).await?;
    let path = upload_dir.join(&name);
    tokio::fs::write(&path, &bytes).await?;

    Ok(json!({
        "name": name,
        "path": path.display().to_string(),
        "size": bytes.len(),
    }))
}

/// Last path segment of the URL, query stripped; a generated name when the
/// URL has no usable segment.
fn file_name_from_url(url: &str) -> String {
    let base = url.split(['?', '#']).next().unwrap_or(url);
    // Skip past the scheme and authority so a path-less URL cannot yield
    // the host as a file name.
    let path = match base.find("://") {
        Some(i) => match base[i + 3..].find('/') {
            Some(j) => &base[i + 3 + j..],
            None => "",
        },
        None => base,
    };
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .map(str::to_string)
        .unwrap_or_else(|| format!("upload-{}", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use robolink_core::bus::LocalBus;
    use robolink_core::directory::{StaticDirectory, TopicInfo};

    #[tokio::test]
    async fn test_service_call_round_trip() {
        let bus = LocalBus::new();
        bus.register_service("/reset_odometry", |req: Value| {
            Ok(json!({ "ok": true, "echo": req }))
        })
        .await;

        let reply = call_service(&bus, "/reset_odometry", json!({"hard": true}))
            .await
            .unwrap();
        assert_eq!(reply["ok"], json!(true));
        assert_eq!(reply["echo"]["hard"], json!(true));
    }

    #[tokio::test]
    async fn test_unknown_service_is_an_error() {
        let bus = LocalBus::new();
        assert!(call_service(&bus, "/missing", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_introspection_lists_topics() {
        let directory = StaticDirectory::new();
        directory.insert("/imu", TopicInfo::new("sensor_msgs/Imu")).await;
        directory.insert("/odom", TopicInfo::new("nav_msgs/Odometry")).await;

        let snapshot = introspect(&directory).await;
        assert_eq!(snapshot["topics"]["/imu"], json!("sensor_msgs/Imu"));
        assert_eq!(snapshot["topics"]["/odom"], json!("nav_msgs/Odometry"));
    }

    #[tokio::test]
    async fn test_download_file_writes_into_upload_dir() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let body = b"P5 2 2 255";
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let http = reqwest::Client::new();
        let url = format!("http://{}/maps/floor2.pgm", addr);
        let reply = download_file(&http, dir.path(), &url).await.unwrap();

        assert_eq!(reply["name"], json!("floor2.pgm"));
        assert_eq!(reply["size"], json!(10));
        let saved = std::fs::read(dir.path().join("floor2.pgm")).unwrap();
        assert_eq!(saved, b"P5 2 2 255");
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("https://x.dev/maps/floor2.pgm"), "floor2.pgm");
        assert_eq!(file_name_from_url("https://x.dev/maps/floor2.pgm?sig=abc"), "floor2.pgm");
        assert!(file_name_from_url("https://x.dev/").starts_with("upload-"));
        assert!(file_name_from_url("https://x.dev").starts_with("upload-"));
    }
}
