//! Video encoding for raw image topics
//!
//! Raw images are converted to I420 and software-encoded to H.264 for the
//! transport. Software encoding at the low frame rates typical of robot
//! camera topics makes every frame close to keyframe cost anyway, so the
//! encoder forces a keyframe at subscription start and on a bounded
//! interval thereafter.
//!
//! The encoder requires a native library and is gated behind the `h264`
//! feature; without it, image topics are marked ignored on first frame.

use crate::{Error, Result};
use robolink_core::ipc::MediaPacket;
use robolink_core::media::{split_nal_units, I420Frame};

/// Video encoder configuration
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Target framerate (frames per second)
    pub framerate: u32,
    /// Forced keyframe interval, in frames
    pub keyframe_interval: u32,
}

impl Default for VideoEncoderConfig {
    fn default() -> Self {
        Self {
            bitrate: 1_500_000,
            framerate: 15,
            keyframe_interval: 30,
        }
    }
}

/// One encoded access unit, split into transport packets
#[derive(Debug, Clone)]
pub struct EncodedAccessUnit {
    pub packets: Vec<MediaPacket>,
    pub keyframe: bool,
}

/// Split an Annex-B access unit into marker-terminated transport packets
pub fn packetize_annex_b(data: &[u8]) -> Vec<MediaPacket> {
    let units = split_nal_units(data);
    let last = units.len().saturating_sub(1);
    units
        .iter()
        .enumerate()
        .map(|(i, nal)| MediaPacket {
            data: nal.to_vec(),
            marker: i == last,
        })
        .collect()
}

/// H.264 software encoder for I420 frames
pub struct VideoEncoder {
    config: VideoEncoderConfig,
    frames_since_key: u32,
    #[cfg(feature = "h264")]
    inner: Option<openh264::encoder::Encoder>,
    #[cfg(feature = "h264")]
    dimensions: Option<(u32, u32)>,
}

impl VideoEncoder {
    pub fn new(config: VideoEncoderConfig) -> Result<Self> {
        if config.framerate == 0 {
            return Err(Error::Encoding("framerate must be non-zero".to_string()));
        }
        Ok(Self {
            config,
            frames_since_key: 0,
            #[cfg(feature = "h264")]
            inner: None,
            #[cfg(feature = "h264")]
            dimensions: None,
        })
    }

    /// Whether the next frame must be a keyframe (start or interval elapsed)
    #[cfg(feature = "h264")]
    fn keyframe_due(&self) -> bool {
        self.frames_since_key == 0 || self.frames_since_key >= self.config.keyframe_interval
    }

    /// Encode one I420 frame
    #[cfg(not(feature = "h264"))]
    pub fn encode(&mut self, _frame: &I420Frame) -> Result<EncodedAccessUnit> {
        Err(Error::Encoding(
            "H.264 encoding requires the 'h264' feature flag".to_string(),
        ))
    }

    /// Encode one I420 frame
    #[cfg(feature = "h264")]
    pub fn encode(&mut self, frame: &I420Frame) -> Result<EncodedAccessUnit> {
        use openh264::encoder::{Encoder, EncoderConfig};
        use openh264::formats::YUVBuffer;

        // (Re)build the encoder when dimensions change mid-stream.
        if self.dimensions != Some((frame.width, frame.height)) {
            let cfg = EncoderConfig::new(frame.width, frame.height)
                .max_frame_rate(self.config.framerate as f32)
                .set_bitrate_bps(self.config.bitrate);
            let encoder = Encoder::with_config(cfg)
                .map_err(|e| Error::Encoding(format!("encoder init: {}", e)))?;
            self.inner = Some(encoder);
            self.dimensions = Some((frame.width, frame.height));
            self.frames_since_key = 0;
        }

        let encoder = self.inner.as_mut().expect("encoder initialized above");
        let force_key = self.keyframe_due();
        if force_key {
            encoder.force_intra_frame(true);
        }

        let yuv = YUVBuffer::from_vec(
            frame.data.clone(),
            frame.width as usize,
            frame.height as usize,
        );
        let bitstream = encoder
            .encode(&yuv)
            .map_err(|e| Error::Encoding(format!("encode: {}", e)))?;
        let annex_b = bitstream.to_vec();

        let packets = packetize_annex_b(&annex_b);
        let keyframe = packets
            .iter()
            .any(|p| robolink_core::media::nal_is_idr(&p.data));

        if keyframe {
            self.frames_since_key = 1;
        } else {
            self.frames_since_key += 1;
        }

        Ok(EncodedAccessUnit { packets, keyframe })
    }
}
