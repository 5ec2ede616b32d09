/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Receiver side of the GigE Vision Streaming Protocol (GVSP).
//!
//! [`receiver::Receiver`] owns a UDP socket and a pre-sized frame buffer,
//! reassembles the leader/data/trailer packets of one frame under a pair of
//! strictly ordered mutexes, and hands decoded frames to a
//! [`receiver::FrameCallback`] registered by the controller.

pub mod decode;
pub mod protocol;
pub mod receiver;

use std::borrow::Cow;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the lifecycle operations of [`receiver::Receiver`].
///
/// These are the only errors that ever reach the controller: protocol
/// anomalies observed by the receive worker (bad status, unsupported pixel
/// format, short datagrams, ...) are never fatal and never propagate here,
/// they are logged through `warnings` and simply drop the offending packet
/// or frame.
#[derive(Debug, Error)]
pub enum Error {
    /// The controller issued an operation that requires `receiving == false`.
    #[error("GVSP: receiver is currently receiving")]
    AlreadyReceiving,

    /// The controller issued an operation that requires `receiving == true`.
    #[error("GVSP: receiver is not receiving")]
    NotReceiving,

    /// `create_buffer`/`start_receive` issued without a socket.
    #[error("GVSP: no socket is open")]
    NoSocket,

    /// `free_buffer`/`start_receive` issued without a frame buffer.
    #[error("GVSP: no frame buffer is allocated")]
    NoBuffer,

    /// `create_buffer` issued while a frame buffer already exists.
    #[error("GVSP: a frame buffer is already allocated")]
    BufferExists,

    /// `packet_size` and `payload_size` don't describe an integral number of
    /// equally sized data packets.
    #[error("GVSP: invalid packet geometry: {0}")]
    InvalidPacketGeometry(Cow<'static, str>),

    /// A mutex guarding receiver state was poisoned by a panicking thread.
    #[error("GVSP: internal lock was poisoned: {0}")]
    Poisoned(Cow<'static, str>),

    /// The underlying OS socket call failed.
    #[error("GVSP: io error: {0}")]
    Io(#[from] std::io::Error),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Poisoned(e.to_string().into())
    }
}
