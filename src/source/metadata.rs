//! Header-only metadata reads for files found by the directory source.
//!
//! Only the bytes needed for pixel dimensions are read; nothing is decoded.
//! Unreadable files report `(0, 0)` so a broken file still gets a row.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

use image::ImageReader;
use tracing::{trace, warn};

use crate::models::MediaKind;

/// Dimension reported for files whose header could not be read.
pub const UNKNOWN_DIMENSION: u32 = 0;

/// Bytes scanned at the start of an MP4/MOV file when looking for `tkhd`.
const MP4_SCAN_BYTES: usize = 128 * 1024;

/// Reads `(width, height)` for a media file of the given kind.
pub fn read_dimensions(path: &Path, kind: MediaKind) -> (u32, u32) {
    match kind {
        MediaKind::Image => read_image_dimensions(path),
        MediaKind::Video => read_video_dimensions(path),
    }
}

/// Modification time (seconds since the epoch) and size in bytes.
pub fn file_stamp(metadata: &std::fs::Metadata) -> (i64, i64) {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    (mtime, metadata.len() as i64)
}

fn read_image_dimensions(path: &Path) -> (u32, u32) {
    let reader = match ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
        Ok(reader) => reader,
        Err(e) => {
            warn!("Failed to open image {:?}: {}", path, e);
            return (UNKNOWN_DIMENSION, UNKNOWN_DIMENSION);
        }
    };

    match reader.into_dimensions() {
        Ok((width, height)) => {
            trace!("Got dimensions {}x{} for {:?}", width, height, path);
            (width, height)
        }
        Err(e) => {
            warn!("Failed to read image dimensions for {:?}: {}", path, e);
            (UNKNOWN_DIMENSION, UNKNOWN_DIMENSION)
        }
    }
}

fn read_video_dimensions(path: &Path) -> (u32, u32) {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    if !matches!(ext.as_str(), "mp4" | "mov" | "3gp") {
        return (UNKNOWN_DIMENSION, UNKNOWN_DIMENSION);
    }

    let mut buffer = vec![0u8; MP4_SCAN_BYTES];
    let read = File::open(path)
        .map(BufReader::new)
        .and_then(|mut reader| reader.read(&mut buffer));
    match read {
        Ok(n) => parse_tkhd_dimensions(&buffer[..n]),
        Err(e) => {
            warn!("Failed to read video {:?}: {}", path, e);
            (UNKNOWN_DIMENSION, UNKNOWN_DIMENSION)
        }
    }
}

/// Finds the first `tkhd` box with non-zero dimensions.
///
/// Width and height are 16.16 fixed point at offset 76 (version 0) or
/// 88 (version 1) from the box type.
fn parse_tkhd_dimensions(buffer: &[u8]) -> (u32, u32) {
    for i in 0..buffer.len().saturating_sub(4) {
        if &buffer[i..i + 4] != b"tkhd" {
            continue;
        }
        let version = buffer.get(i + 4).copied().unwrap_or(0);
        let offset = if version == 0 { i + 76 } else { i + 88 };
        let Some(bytes) = buffer.get(offset..offset + 8) else {
            continue;
        };

        let width = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) >> 16;
        let height = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) >> 16;
        if width > 0 && height > 0 {
            trace!("MP4 parsed dimensions: {}x{}", width, height);
            return (width, height);
        }
    }
    (UNKNOWN_DIMENSION, UNKNOWN_DIMENSION)
}
