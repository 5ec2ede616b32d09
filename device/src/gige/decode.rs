/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Bit-packed monochrome pixel decoders (component C1).
//!
//! Each decoder reads the first `frame_size * bits_per_pixel / 8` bytes
//! (rounded up) of an assembled frame buffer and produces a freshly
//! allocated pixel array. Decoders never touch a lock: the caller (the
//! trailer handler in [`super::receiver`]) holds `frame_lock` for the
//! duration of the call and owns the snapshot they read.
//!
//! Packed formats (`Mono10Packed`, `Mono12Packed`) write their two decoded
//! samples starting at output index 0. The original C implementation this
//! crate is modeled on instead starts at index 2, leaving the first two
//! pixels of every frame uninitialised and silently truncating the last
//! sample pair — an open question (spec.md §9 item 1) resolved here in
//! favor of index 0, which is almost certainly what was intended.

use super::protocol::PixelFormat;

/// A decoded pixel array, typed by the camera's native sample width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pixels {
    Eight(Vec<u8>),
    Sixteen(Vec<u16>),
}

impl Pixels {
    pub fn len(&self) -> usize {
        match self {
            Self::Eight(v) => v.len(),
            Self::Sixteen(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bytes of `frame_buffer` are fewer than the pixel format needs for
/// `size_x * size_y` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame buffer has {got} bytes, decoding {frame_size} {format:?} pixels needs {needed}")]
pub struct ShortBuffer {
    pub format: PixelFormat,
    pub frame_size: usize,
    pub needed: usize,
    pub got: usize,
}

/// Decodes `bytes` (the frame buffer) as `size_x * size_y` samples of
/// `format`, returning the pixel array and the camera's reported bit depth.
pub fn decode(
    format: PixelFormat,
    bytes: &[u8],
    size_x: u32,
    size_y: u32,
) -> Result<(Pixels, u8), ShortBuffer> {
    let frame_size = size_x as usize * size_y as usize;
    let bit_depth = format.bit_depth();

    let needed = required_bytes(format, frame_size);
    if bytes.len() < needed {
        return Err(ShortBuffer {
            format,
            frame_size,
            needed,
            got: bytes.len(),
        });
    }
    let bytes = &bytes[..needed];

    let pixels = match format {
        PixelFormat::Mono8 => Pixels::Eight(bytes.to_vec()),
        PixelFormat::Mono10 => Pixels::Sixteen(unpack_12bit_le(bytes, frame_size, 0x03ff)),
        PixelFormat::Mono12 => Pixels::Sixteen(unpack_12bit_le(bytes, frame_size, 0x0fff)),
        PixelFormat::Mono16 => Pixels::Sixteen(unpack_16bit_le(bytes, frame_size)),
        PixelFormat::Mono10Packed => Pixels::Sixteen(unpack_10_12_packed(bytes, frame_size, 2)),
        PixelFormat::Mono12Packed => Pixels::Sixteen(unpack_10_12_packed(bytes, frame_size, 4)),
    };

    Ok((pixels, bit_depth))
}

fn required_bytes(format: PixelFormat, frame_size: usize) -> usize {
    match format {
        PixelFormat::Mono8 => frame_size,
        PixelFormat::Mono10 | PixelFormat::Mono12 | PixelFormat::Mono16 => frame_size * 2,
        PixelFormat::Mono10Packed | PixelFormat::Mono12Packed => (frame_size * 3 + 1) / 2,
    }
}

/// MONO10/MONO12: `(b1 & mask_hi) << 8 | b0`, samples little-endian.
fn unpack_12bit_le(bytes: &[u8], frame_size: usize, mask: u16) -> Vec<u16> {
    let hi_mask = (mask >> 8) as u8;
    bytes
        .chunks_exact(2)
        .take(frame_size)
        .map(|pair| {
            let b0 = pair[0] as u16;
            let b1 = (pair[1] & hi_mask) as u16;
            (b1 << 8) | b0
        })
        .collect()
}

/// MONO16: `b1 << 8 | b0`, samples little-endian.
fn unpack_16bit_le(bytes: &[u8], frame_size: usize) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .take(frame_size)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// MONO10PACKED/MONO12PACKED: two samples packed into three bytes.
/// `shift` is the number of bits each high byte is shifted left (4 for
/// 12-bit, 2 for 10-bit); the low nibble/pair of bits of the middle byte
/// fills in the low bits of each sample.
fn unpack_10_12_packed(bytes: &[u8], frame_size: usize, shift: u32) -> Vec<u16> {
    let low_mask: u8 = if shift == 4 { 0x0f } else { 0x03 };
    let mut out = Vec::with_capacity(frame_size);

    for triplet in bytes.chunks(3) {
        if out.len() >= frame_size {
            break;
        }
        let b0 = triplet[0] as u16;
        let b1 = triplet.get(1).copied().unwrap_or(0);
        let b2 = triplet.get(2).copied().unwrap_or(0) as u16;

        let s0 = (b0 << shift) | (b1 & low_mask) as u16;
        out.push(s0);
        if out.len() >= frame_size {
            break;
        }
        let s1 = (b2 << shift) | ((b1 & (low_mask << 4)) >> 4) as u16;
        out.push(s1);
    }

    out
}
