//! Bus-side media payload formats
//!
//! The media workers parse two payload families off the bus: raw images
//! (`RawImage`, container-native pixel formats converted to I420 before
//! encoding) and pre-encoded video (`EncodedVideo`, H.264 Annex-B split
//! into NAL-unit packets without re-encoding).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Pixel encodings accepted on image topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelEncoding {
    Rgb8,
    Bgr8,
    /// Packed YUYV 4:2:2
    Yuv422,
    /// Planar YUV 4:2:0, passed through as-is
    I420,
}

impl PixelEncoding {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "rgb8" => Some(Self::Rgb8),
            "bgr8" => Some(Self::Bgr8),
            "yuv422" | "yuyv" => Some(Self::Yuv422),
            "i420" | "yuv420p" => Some(Self::I420),
            _ => None,
        }
    }

    /// Bytes per row for a given width
    pub fn stride(&self, width: u32) -> usize {
        match self {
            Self::Rgb8 | Self::Bgr8 => width as usize * 3,
            Self::Yuv422 => width as usize * 2,
            Self::I420 => width as usize, // luma plane stride
        }
    }
}

/// A raw image message as published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub encoding: PixelEncoding,
    pub data: Vec<u8>,
}

impl RawImage {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let img: RawImage = bincode::deserialize(payload)?;
        img.validate()?;
        Ok(img)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::UnsupportedMedia("zero image dimension".into()));
        }
        let expected = match self.encoding {
            PixelEncoding::I420 => i420_size(self.width, self.height),
            other => other.stride(self.width) * self.height as usize,
        };
        if self.data.len() < expected {
            return Err(Error::UnsupportedMedia(format!(
                "image data truncated: {} < {}",
                self.data.len(),
                expected
            )));
        }
        Ok(())
    }

    /// Convert to planar I420. Odd dimensions are truncated to even.
    pub fn to_i420(&self) -> Result<I420Frame> {
        let width = self.width & !1;
        let height = self.height & !1;
        match self.encoding {
            PixelEncoding::I420 => Ok(I420Frame {
                width,
                height,
                data: self.data[..i420_size(width, height)].to_vec(),
            }),
            PixelEncoding::Rgb8 => Ok(rgb_to_i420(self, width, height, false)),
            PixelEncoding::Bgr8 => Ok(rgb_to_i420(self, width, height, true)),
            PixelEncoding::Yuv422 => Ok(yuyv_to_i420(self, width, height)),
        }
    }
}

/// Planar YUV 4:2:0 frame: Y plane, then U, then V
#[derive(Debug, Clone, PartialEq)]
pub struct I420Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

fn i420_size(width: u32, height: u32) -> usize {
    let w = width as usize;
    let h = height as usize;
    w * h + 2 * ((w / 2) * (h / 2))
}

// BT.601 full-range RGB → YUV
fn rgb_pixel_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (
        y.clamp(0, 255) as u8,
        u.clamp(0, 255) as u8,
        v.clamp(0, 255) as u8,
    )
}

fn rgb_to_i420(img: &RawImage, width: u32, height: u32, swap: bool) -> I420Frame {
    let w = width as usize;
    let h = height as usize;
    let stride = img.encoding.stride(img.width);
    let mut data = vec![0u8; i420_size(width, height)];
    let (y_plane, uv) = data.split_at_mut(w * h);
    let (u_plane, v_plane) = uv.split_at_mut((w / 2) * (h / 2));

    for row in 0..h {
        for col in 0..w {
            let off = row * stride + col * 3;
            let (r, g, b) = if swap {
                (img.data[off + 2], img.data[off + 1], img.data[off])
            } else {
                (img.data[off], img.data[off + 1], img.data[off + 2])
            };
            let (y, u, v) = rgb_pixel_to_yuv(r, g, b);
            y_plane[row * w + col] = y;
            // Chroma from the top-left pixel of each 2x2 block.
            if row % 2 == 0 && col % 2 == 0 {
                let idx = (row / 2) * (w / 2) + col / 2;
                u_plane[idx] = u;
                v_plane[idx] = v;
            }
        }
    }
    I420Frame {
        width,
        height,
        data,
    }
}

fn yuyv_to_i420(img: &RawImage, width: u32, height: u32) -> I420Frame {
    let w = width as usize;
    let h = height as usize;
    let stride = img.encoding.stride(img.width);
    let mut data = vec![0u8; i420_size(width, height)];
    let (y_plane, uv) = data.split_at_mut(w * h);
    let (u_plane, v_plane) = uv.split_at_mut((w / 2) * (h / 2));

    for row in 0..h {
        for pair in 0..w / 2 {
            let off = row * stride + pair * 4;
            let (y0, u, y1, v) = (
                img.data[off],
                img.data[off + 1],
                img.data[off + 2],
                img.data[off + 3],
            );
            y_plane[row * w + pair * 2] = y0;
            y_plane[row * w + pair * 2 + 1] = y1;
            if row % 2 == 0 {
                let idx = (row / 2) * (w / 2) + pair;
                u_plane[idx] = u;
                v_plane[idx] = v;
            }
        }
    }
    I420Frame {
        width,
        height,
        data,
    }
}

/// A pre-encoded video message as published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedVideo {
    /// Codec name; only `h264` (Annex-B) is currently supported
    pub format: String,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

impl EncodedVideo {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(payload)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Split an Annex-B elementary stream into NAL units (start codes stripped)
///
/// Accepts both 3-byte (`00 00 01`) and 4-byte (`00 00 00 01`) start codes.
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                if s < code_start {
                    units.push(&data[s..code_start]);
                }
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < data.len() {
            units.push(&data[s..]);
        }
    }
    units
}

/// Whether a NAL unit is an IDR slice (H.264 keyframe)
pub fn nal_is_idr(nal: &[u8]) -> bool {
    nal.first().map(|b| b & 0x1F == 5).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_image(encoding: PixelEncoding, width: u32, height: u32) -> RawImage {
        let len = match encoding {
            PixelEncoding::I420 => i420_size(width, height),
            other => other.stride(width) * height as usize,
        };
        RawImage {
            width,
            height,
            encoding,
            data: vec![128; len],
        }
    }

    #[test]
    fn test_rgb_to_i420_dimensions() {
        let img = gray_image(PixelEncoding::Rgb8, 4, 4);
        let frame = img.to_i420().unwrap();
        assert_eq!(frame.width, 4);
        assert_eq!(frame.height, 4);
        assert_eq!(frame.data.len(), 4 * 4 + 2 * (2 * 2));
    }

    #[test]
    fn test_bgr_red_pixel() {
        // A pure-red BGR image: B=0, G=0, R=255.
        let mut img = gray_image(PixelEncoding::Bgr8, 2, 2);
        for px in img.data.chunks_mut(3) {
            px[0] = 0;
            px[1] = 0;
            px[2] = 255;
        }
        let frame = img.to_i420().unwrap();
        // Red has high V chroma.
        let v = frame.data[2 * 2 + 1];
        assert!(v > 200, "expected high V for red, got {}", v);
    }

    #[test]
    fn test_yuyv_to_i420() {
        let img = gray_image(PixelEncoding::Yuv422, 4, 2);
        let frame = img.to_i420().unwrap();
        assert_eq!(frame.data.len(), 4 * 2 + 2 * (2 * 1));
        assert!(frame.data.iter().all(|&b| b == 128));
    }

    #[test]
    fn test_truncated_image_rejected() {
        let img = RawImage {
            width: 64,
            height: 64,
            encoding: PixelEncoding::Rgb8,
            data: vec![0; 10],
        };
        assert!(RawImage::decode(&img.encode().unwrap()).is_err());
    }

    #[test]
    fn test_split_nal_units_mixed_start_codes() {
        let stream = [
            0, 0, 0, 1, 0x67, 0xAA, // SPS, 4-byte code
            0, 0, 1, 0x68, 0xBB, // PPS, 3-byte code
            0, 0, 0, 1, 0x65, 0x01, 0x02, // IDR
        ];
        let units = split_nal_units(&stream);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], &[0x67, 0xAA]);
        assert_eq!(units[1], &[0x68, 0xBB]);
        assert!(nal_is_idr(units[2]));
        assert!(!nal_is_idr(units[0]));
    }

    #[test]
    fn test_split_nal_units_no_start_code() {
        assert!(split_nal_units(&[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn test_encoded_video_round_trip() {
        let ev = EncodedVideo {
            format: "h264".into(),
            keyframe: true,
            data: vec![0, 0, 1, 0x65],
        };
        let back = EncodedVideo::decode(&ev.encode().unwrap()).unwrap();
        assert_eq!(back, ev);
    }
}
