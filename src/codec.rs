use crate::error::{DecodeError, DecodeResult};
use crate::frame_table::FrameTableEntry;

use clap::ValueEnum;
use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

pub const FLAT_GRAY: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[value(rename_all = "lower")]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Float64,
    Float32,
    Uint16,
    Uint8,
}

impl Precision {
    pub fn sample_size(self) -> usize {
        match self {
            Precision::Float64 => 8,
            Precision::Float32 => 4,
            Precision::Uint16 => 2,
            Precision::Uint8 => 1,
        }
    }

    fn read(self, chunk: &[u8]) -> f64 {
        match self {
            Precision::Float64 => f64::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]),
            Precision::Float32 => {
                f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            }
            Precision::Uint16 => f64::from(u16::from_le_bytes([chunk[0], chunk[1]])),
            Precision::Uint8 => f64::from(chunk[0]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub rows: u32,
    pub cols: u32,
    pub png: Vec<u8>,
}

pub fn decode_whole_buffer(
    buf: &[u8],
    rows: u32,
    cols: u32,
    precision: Precision,
) -> DecodeResult<EncodedImage> {
    let pixels = pixel_count(rows, cols)?;
    let need = pixels
        .checked_mul(precision.sample_size())
        .ok_or_else(|| DecodeError::InvalidGeometry(format!("{}x{} overflows", rows, cols)))?;
    if buf.len() < need {
        return Err(DecodeError::BufferTooSmall(format!(
            "{}x{} {:?} needs {} bytes, buffer has {}",
            rows,
            cols,
            precision,
            need,
            buf.len()
        )));
    }

    let samples: Vec<f64> = buf[..need]
        .chunks_exact(precision.sample_size())
        .map(|c| precision.read(c))
        .collect();
    encode_samples(&samples, rows, cols)
}

pub fn decode_one_frame(
    entry: &FrameTableEntry,
    buf: &[u8],
    header_end: u64,
    rows: u32,
    cols: u32,
) -> DecodeResult<EncodedImage> {
    let pixels = pixel_count(rows, cols)?;
    let (start, end) = entry.payload_range(header_end);
    // A declared length running past the buffer is cut at the buffer end.
    let end = end.min(buf.len() as u64);

    let available = end.saturating_sub(start) / 2;
    if available < pixels as u64 {
        return Err(DecodeError::FrameDataTooSmall(format!(
            "{}x{} needs {} samples, record [{}, {}) of a {}-byte buffer holds {}",
            rows,
            cols,
            pixels,
            start,
            end,
            buf.len(),
            available
        )));
    }

    let start = start as usize;
    let samples: Vec<f64> = buf[start..start + pixels * 2]
        .chunks_exact(2)
        .map(|c| f64::from(i16::from_le_bytes([c[0], c[1]])))
        .collect();
    encode_samples(&samples, rows, cols)
}

fn encode_samples(samples: &[f64], rows: u32, cols: u32) -> DecodeResult<EncodedImage> {
    let rgba = normalize_to_rgba(samples);
    let png = encode_png(rgba, rows, cols)?;
    Ok(EncodedImage { rows, cols, png })
}

fn pixel_count(rows: u32, cols: u32) -> DecodeResult<usize> {
    if rows == 0 || cols == 0 {
        return Err(DecodeError::InvalidGeometry(format!(
            "rows and cols must be > 0, got {}x{}",
            rows, cols
        )));
    }
    (rows as usize)
        .checked_mul(cols as usize)
        .ok_or_else(|| DecodeError::InvalidGeometry(format!("{}x{} overflows", rows, cols)))
}

// Rescale samples onto opaque grayscale RGBA. Non-finite samples take no part
// in the min/max scan and render black.
pub fn normalize_to_rgba(samples: &[f64]) -> Vec<u8> {
    let (min_val, max_val) = samples
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    let flat = max_val <= min_val;
    let range = max_val - min_val;

    let mut out = Vec::with_capacity(samples.len() * 4);
    for &v in samples {
        let gray = if flat {
            FLAT_GRAY
        } else if !v.is_finite() {
            0
        } else {
            (((v - min_val) / range) * 255.0).clamp(0.0, 255.0).round() as u8
        };
        out.extend_from_slice(&[gray, gray, gray, 255]);
    }
    out
}

pub fn encode_png(rgba: Vec<u8>, rows: u32, cols: u32) -> DecodeResult<Vec<u8>> {
    let img = RgbaImage::from_raw(cols, rows, rgba).ok_or_else(|| {
        DecodeError::CodecInitFailure(format!("raster {}x{} does not match pixel data", rows, cols))
    })?;
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .map_err(|e| DecodeError::CodecInitFailure(format!("png encode: {}", e)))?;
    Ok(out.into_inner())
}
