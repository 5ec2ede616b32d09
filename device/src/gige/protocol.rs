/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! GVSP packet header parsing and the pixel-format code table.
//!
//! A GVSP packet never fails to *parse* its header (all eight header bytes
//! are always present in a UDP datagram this crate accepts), but the header
//! may describe a packet this receiver must reject. [`PacketHeader::parse`]
//! therefore never returns `Err` for a short datagram; callers that hand it
//! fewer than [`GVSP_HEADER_SIZE`] bytes get [`HeaderError::Short`].

use std::convert::TryFrom;
use std::io;

use gvsp_impl::bytes_io::ReadBytes;
use thiserror::Error;

/// Size in bytes of the fixed GVSP packet header that precedes every
/// leader, trailer and data packet.
pub const GVSP_HEADER_SIZE: usize = 8;

/// Why a datagram's header could not be turned into a [`PacketHeader`].
///
/// None of these are fatal to the receiver: the caller drops the packet and,
/// if `warnings` is enabled, logs one of these at `warn` level.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Datagram is shorter than [`GVSP_HEADER_SIZE`].
    #[error("datagram shorter than the GVSP header ({0} bytes)")]
    Short(usize),
}

/// Status word carried in bytes 0-1 of the header.
///
/// Any value other than `0x0000` marks the packet as a resend/error
/// indication this receiver does not support; [`PacketHeader::status_ok`]
/// is the only thing callers need from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    pub fn is_ok(self) -> bool {
        self.0 == 0x0000
    }
}

/// The packet-format nibble in byte 4 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    Leader,
    Trailer,
    Data,
    /// A format code this receiver doesn't recognise; the packet is a no-op.
    Other(u8),
}

impl PacketFormat {
    fn from_nibble(nibble: u8) -> Self {
        match nibble {
            1 => Self::Leader,
            2 => Self::Trailer,
            3 => Self::Data,
            other => Self::Other(other),
        }
    }
}

/// Parsed 8-byte GVSP packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub status: Status,
    pub block_id: u16,
    pub extended_id: bool,
    pub format: PacketFormat,
    /// 24-bit packet sequence number; meaningful only for data packets.
    pub packet_id: u32,
}

impl PacketHeader {
    /// Parses the first [`GVSP_HEADER_SIZE`] bytes of `datagram`.
    pub fn parse(datagram: &[u8]) -> Result<Self, HeaderError> {
        if datagram.len() < GVSP_HEADER_SIZE {
            return Err(HeaderError::Short(datagram.len()));
        }

        let mut cursor = io::Cursor::new(datagram);
        // Infallible: `cursor` was just shown to hold >= GVSP_HEADER_SIZE bytes.
        let status: u16 = cursor.read_bytes_be().unwrap();
        let block_id: u16 = cursor.read_bytes_be().unwrap();
        let flags_and_id: u32 = cursor.read_bytes_be().unwrap();

        let extended_id = (flags_and_id >> 31) == 1;
        let format_byte = (flags_and_id >> 24) as u8;
        let format = PacketFormat::from_nibble(format_byte & 0x0f);
        let packet_id = flags_and_id & 0x00ff_ffff;

        Ok(Self {
            status: Status(status),
            block_id,
            extended_id,
            format,
            packet_id,
        })
    }

    /// Payload bytes following the 8-byte header in the same datagram.
    pub fn payload(datagram: &[u8]) -> &[u8] {
        &datagram[GVSP_HEADER_SIZE..]
    }
}

/// Monochrome pixel formats this receiver can decode.
///
/// Four-byte codes match the GenICam `PixelFormat` register values; every
/// other valid GenICam code (colour/Bayer, compressed, chunk, ...) is out of
/// scope and rejected by [`PixelFormat::try_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Mono8,
    Mono10,
    Mono10Packed,
    Mono12,
    Mono12Packed,
    Mono16,
}

impl PixelFormat {
    /// Camera-reported bit depth of a decoded sample.
    pub fn bit_depth(self) -> u8 {
        match self {
            Self::Mono8 => 8,
            Self::Mono10 | Self::Mono10Packed => 10,
            Self::Mono12 | Self::Mono12Packed => 12,
            Self::Mono16 => 16,
        }
    }
}

impl TryFrom<u32> for PixelFormat {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, u32> {
        match code {
            0x0108_0001 => Ok(Self::Mono8),
            0x0110_0003 => Ok(Self::Mono10),
            0x010C_0004 => Ok(Self::Mono10Packed),
            0x0110_0005 => Ok(Self::Mono12),
            0x010C_0006 => Ok(Self::Mono12Packed),
            0x0110_0007 => Ok(Self::Mono16),
            other => Err(other),
        }
    }
}

/// The fixed payload-type code for an uncompressed image leader (§6).
const IMAGE_PAYLOAD_TYPE: u16 = 0x0001;

/// Minimum leader/trailer content length this receiver requires (§4.3).
pub const MIN_LEADER_TRAILER_CONTENT: usize = 12;

/// Why a leader's content bytes could not be interpreted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaderError {
    #[error("leader payload has {0} content bytes, need at least {MIN_LEADER_TRAILER_CONTENT}")]
    Short(usize),
    #[error("leader payload type {0:#06x} is not the uncompressed-image format")]
    NotImage(u16),
    #[error("leader declares an interlaced frame (field_info = {0:#04x})")]
    Interlaced(u8),
    #[error("leader declares unsupported pixel format {0:#010x}")]
    UnsupportedPixelFormat(u32),
}

/// The fields this receiver cares about from an uncompressed-image leader's
/// 36-byte content (§6): `field_info`, `pixel_format`, `size_x`, `size_y`.
/// Timestamp, offsets and padding are parsed by the original GVSP leader but
/// intentionally ignored here (Non-goals: ROI offsets, row padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLeader {
    pub pixel_format: PixelFormat,
    pub size_x: u32,
    pub size_y: u32,
}

impl ImageLeader {
    /// Parses the content bytes following a leader's GVSP header.
    ///
    /// `content` must be at least [`MIN_LEADER_TRAILER_CONTENT`] bytes;
    /// returns [`LeaderError::Short`] otherwise. Timestamp, offsets and
    /// padding beyond the first 12 content bytes are read only when present
    /// (a full 36-byte uncompressed-image leader); a leader truncated to
    /// exactly 12 bytes of unrelated content is rejected by a field_info or
    /// payload_type mismatch before those trailing fields matter.
    pub fn parse(content: &[u8]) -> Result<Self, LeaderError> {
        if content.len() < MIN_LEADER_TRAILER_CONTENT {
            return Err(LeaderError::Short(content.len()));
        }

        let field_info = content[0];
        if field_info != 0 {
            return Err(LeaderError::Interlaced(field_info));
        }

        let mut cursor = io::Cursor::new(content);
        cursor.set_position(2);
        let payload_type: u16 = cursor.read_bytes_be().unwrap();
        if payload_type != IMAGE_PAYLOAD_TYPE {
            return Err(LeaderError::NotImage(payload_type));
        }

        // Need pixel_format/size_x/size_y (bytes 12..24); only present in a
        // full 36-byte uncompressed-image leader.
        if content.len() < 24 {
            return Err(LeaderError::Short(content.len()));
        }
        cursor.set_position(12);
        let pixel_format_code: u32 = cursor.read_bytes_be().unwrap();
        let size_x: u32 = cursor.read_bytes_be().unwrap();
        let size_y: u32 = cursor.read_bytes_be().unwrap();

        let pixel_format = PixelFormat::try_from(pixel_format_code)
            .map_err(LeaderError::UnsupportedPixelFormat)?;

        Ok(Self {
            pixel_format,
            size_x,
            size_y,
        })
    }
}
