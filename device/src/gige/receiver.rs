/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Lifecycle controller (C5), receive loop (C4), frame assembler (C3) and
//! delivery adapter (C6) for a single GVSP stream.
//!
//! [`Receiver`] is the handle returned to the controller. It owns a UDP
//! socket and a pre-sized frame buffer; a dedicated worker thread, spawned
//! by [`Receiver::start_receive`], drives [`PacketHeader`] classification
//! and frame assembly. Two mutexes guard it: `enable_lock` guards the
//! `receiving` flag, `frame_lock` guards everything else (buffer contents,
//! geometry, the callback slot). The `verbose`/`warnings` feedback toggles
//! are advisory, not part of the frame-assembly invariants `frame_lock`
//! protects, so they live in their own `AtomicBool`s and are readable by
//! the worker without acquiring any lock. The socket itself lives behind
//! its own mutex purely so the controller can replace it between
//! `create_socket`/`close_socket`; once streaming starts, the worker holds
//! an `Arc` clone of the socket and never touches that mutex again,
//! matching the wire spec's observation that no lock is needed for the
//! worker's reads of the socket.
//!
//! Lock order is strict: `frame_lock` before `enable_lock`, never the
//! reverse.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::decode::{self, Pixels};
use super::protocol::{self, ImageLeader, PacketFormat, PacketHeader, PixelFormat};
use super::{Error, Result};

/// Socket read timeout; bounds how promptly `stop_receive` can observe the
/// `receiving` flag going false.
const SOCKET_TIMEOUT: Duration = Duration::from_millis(100);

/// Scratch datagram buffer size; large enough for any conformant GVSP MTU.
const SCRATCH_BUFFER_SIZE: usize = 2048;

/// IP + UDP + GVSP header overhead subtracted from a packet's MTU to get
/// `packet_payload_size` in [`Receiver::create_buffer`].
const PACKET_OVERHEAD: usize = 36;

/// A frame handed to the consumer once a trailer confirms complete receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub pixels: Pixels,
    pub bit_depth: u8,
    pub size_x: u32,
    pub size_y: u32,
}

/// Receives completed, decoded frames from a [`Receiver`].
///
/// Invoked synchronously on the receive thread while `frame_lock` is held;
/// it therefore must not call back into any `Receiver` method that takes
/// `frame_lock` (every lifecycle method except [`Receiver::is_receiving`],
/// [`Receiver::close_socket`]/[`Receiver::port`], which only touch the
/// socket mutex, and [`Receiver::set_verbose`]/[`Receiver::set_warnings`],
/// which touch no lock at all).
pub trait FrameCallback {
    fn on_frame(&mut self, frame: Frame);
}

impl<F> FrameCallback for F
where
    F: FnMut(Frame) + Send,
{
    fn on_frame(&mut self, frame: Frame) {
        (self)(frame)
    }
}

struct SocketHandle {
    socket: Arc<UdpSocket>,
    port: u16,
}

/// Everything `frame_lock` protects: geometry, the buffer, per-frame
/// bookkeeping and the callback slot.
struct FrameState {
    pixel_format: Option<PixelFormat>,
    size_x: u32,
    size_y: u32,
    payload_size: usize,
    packet_payload_size: usize,
    packet_count: usize,
    frame_buffer: Option<Vec<u8>>,
    leader_received: bool,
    received_packets: usize,
    frame_callback: Option<Box<dyn FrameCallback + Send>>,
}

impl Default for FrameState {
    fn default() -> Self {
        Self {
            pixel_format: None,
            size_x: 0,
            size_y: 0,
            payload_size: 0,
            packet_payload_size: 0,
            packet_count: 0,
            frame_buffer: None,
            leader_received: false,
            received_packets: 0,
            frame_callback: None,
        }
    }
}

/// Owns the socket and frame buffer of a single GVSP stream.
///
/// Created by [`Receiver::create_socket`], destroyed by
/// [`Receiver::close_socket`]. A frame buffer is allocated by
/// [`Receiver::create_buffer`] and released by [`Receiver::free_buffer`];
/// the receive thread exists only between [`Receiver::start_receive`] and
/// [`Receiver::stop_receive`]. Every lifecycle call that mutates the
/// buffer, callback or socket requires `receiving == false`.
pub struct Receiver {
    socket: Mutex<Option<SocketHandle>>,
    enable_lock: Mutex<bool>,
    frame_lock: Mutex<FrameState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    verbose: AtomicBool,
    warnings: AtomicBool,
}

impl Receiver {
    /// Binds a UDP socket to `host_addr:0`, reads back the ephemeral port
    /// the OS assigned, and sets a 100ms receive timeout.
    pub fn create_socket(host_addr: IpAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(SocketAddr::new(host_addr, 0))?;
        socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        let port = socket.local_addr()?.port();

        Ok(Arc::new(Self {
            socket: Mutex::new(Some(SocketHandle {
                socket: Arc::new(socket),
                port,
            })),
            enable_lock: Mutex::new(false),
            frame_lock: Mutex::new(FrameState::default()),
            worker: Mutex::new(None),
            verbose: AtomicBool::new(false),
            warnings: AtomicBool::new(false),
        }))
    }

    /// The ephemeral UDP port assigned by `create_socket`.
    pub fn port(&self) -> Result<u16> {
        let guard = self.socket.lock()?;
        guard.as_ref().map(|s| s.port).ok_or(Error::NoSocket)
    }

    /// Closes the socket and releases it. Requires `receiving == false`.
    pub fn close_socket(&self) -> Result<()> {
        self.ensure_not_receiving()?;
        let mut guard = self.socket.lock()?;
        if guard.take().is_none() {
            return Err(Error::NoSocket);
        }
        Ok(())
    }

    /// Allocates a frame buffer sized for `payload_size` bytes, split into
    /// packets of `packet_size` bytes on the wire (including the 36-byte
    /// IP+UDP+GVSP overhead). Requires `receiving == false` and no existing
    /// buffer; `payload_size` must be an exact multiple of
    /// `packet_size - 36`.
    pub fn create_buffer(&self, payload_size: usize, packet_size: usize) -> Result<()> {
        self.ensure_not_receiving()?;

        let packet_payload_size = packet_size.checked_sub(PACKET_OVERHEAD).ok_or_else(|| {
            Error::InvalidPacketGeometry(
                format!(
                    "packet_size {packet_size} must exceed the {PACKET_OVERHEAD}-byte GVSP overhead"
                )
                .into(),
            )
        })?;
        if packet_payload_size == 0 {
            return Err(Error::InvalidPacketGeometry(
                "packet_payload_size must be greater than zero".into(),
            ));
        }
        if payload_size == 0 || payload_size % packet_payload_size != 0 {
            return Err(Error::InvalidPacketGeometry(
                format!(
                    "payload_size {payload_size} is not a multiple of packet_payload_size {packet_payload_size}"
                )
                .into(),
            ));
        }

        let mut frame = self.frame_lock.lock()?;
        if frame.frame_buffer.is_some() {
            return Err(Error::BufferExists);
        }

        let packet_count = payload_size / packet_payload_size;
        if self.verbose.load(Ordering::Relaxed) {
            log::debug!(
                "GVSP: allocated {payload_size}-byte frame buffer ({packet_count} packets of {packet_payload_size} bytes)"
            );
        }
        frame.frame_buffer = Some(vec![0u8; payload_size]);
        frame.payload_size = payload_size;
        frame.packet_payload_size = packet_payload_size;
        frame.packet_count = packet_count;
        frame.received_packets = 0;
        frame.leader_received = false;
        Ok(())
    }

    /// Releases the frame buffer. Requires `receiving == false` and an
    /// existing buffer.
    pub fn free_buffer(&self) -> Result<()> {
        self.ensure_not_receiving()?;
        let mut frame = self.frame_lock.lock()?;
        if frame.frame_buffer.take().is_none() {
            return Err(Error::NoBuffer);
        }
        frame.payload_size = 0;
        frame.packet_payload_size = 0;
        frame.packet_count = 0;
        frame.received_packets = 0;
        frame.leader_received = false;
        if self.verbose.load(Ordering::Relaxed) {
            log::debug!("GVSP: released frame buffer");
        }
        Ok(())
    }

    /// Replaces the frame callback atomically. `None` discards completed
    /// frames instead of delivering them.
    pub fn set_frame_callback(&self, callback: Option<Box<dyn FrameCallback + Send>>) -> Result<()> {
        let mut frame = self.frame_lock.lock()?;
        frame.frame_callback = callback;
        Ok(())
    }

    /// Toggles `log::debug!` lifecycle tracing. Callable at any time, even
    /// while receiving; takes no lock.
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    /// Toggles `log::warn!` protocol-anomaly logging. Callable at any time,
    /// even while receiving; takes no lock.
    pub fn set_warnings(&self, warnings: bool) {
        self.warnings.store(warnings, Ordering::Relaxed);
    }

    /// Whether the receive loop is currently running.
    pub fn is_receiving(&self) -> Result<bool> {
        Ok(*self.enable_lock.lock()?)
    }

    fn ensure_not_receiving(&self) -> Result<()> {
        if *self.enable_lock.lock()? {
            Err(Error::AlreadyReceiving)
        } else {
            Ok(())
        }
    }

    /// Sends a four-byte hole-punch datagram to `peer_addr` at this
    /// receiver's own port, then starts the receive worker. Requires a
    /// socket and buffer, and `receiving == false`.
    pub fn start_receive(self: &Arc<Self>, peer_addr: IpAddr) -> Result<()> {
        // frame_lock outer, enable_lock inner: the order the worker loop
        // also uses.
        let frame = self.frame_lock.lock()?;
        if frame.frame_buffer.is_none() {
            return Err(Error::NoBuffer);
        }
        let mut enabled = self.enable_lock.lock()?;
        if *enabled {
            return Err(Error::AlreadyReceiving);
        }

        let sock_guard = self.socket.lock()?;
        let handle = sock_guard.as_ref().ok_or(Error::NoSocket)?;
        handle
            .socket
            .send_to(&[0u8; 4], SocketAddr::new(peer_addr, handle.port))?;
        let worker_socket = Arc::clone(&handle.socket);
        drop(sock_guard);

        if self.verbose.load(Ordering::Relaxed) {
            log::debug!("GVSP: sent hole-punch datagram to {peer_addr}, starting receive loop");
        }

        *enabled = true;
        drop(enabled);
        drop(frame);

        let receiver = Arc::clone(self);
        let join_handle = thread::spawn(move || receiver.run_loop(worker_socket));
        *self.worker.lock()? = Some(join_handle);
        Ok(())
    }

    /// Clears `receiving` under `enable_lock`, then joins the worker
    /// without holding any lock it might need. Requires `receiving == true`.
    pub fn stop_receive(&self) -> Result<()> {
        {
            let mut enabled = self.enable_lock.lock()?;
            if !*enabled {
                return Err(Error::NotReceiving);
            }
            *enabled = false;
        }

        if let Some(handle) = self.worker.lock()?.take() {
            handle
                .join()
                .map_err(|_| Error::Poisoned("receive worker thread panicked".into()))?;
        }
        Ok(())
    }

    fn run_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut scratch = [0u8; SCRATCH_BUFFER_SIZE];

        loop {
            let recv_result = socket.recv_from(&mut scratch);

            let mut frame = match self.frame_lock.lock() {
                Ok(guard) => guard,
                Err(_) => break,
            };

            match recv_result {
                Ok((len, _peer)) => self.dispatch(&mut frame, &scratch[..len]),
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => {
                    if self.warnings.load(Ordering::Relaxed) {
                        log::warn!("GVSP: socket recv error: {e}");
                    }
                }
            }

            // enable_lock is acquired strictly inside frame_lock to check the
            // exit condition, per the receiver's lock-order invariant; the
            // enable_lock guard drops at the end of this match arm, then
            // frame_lock drops explicitly below.
            let enabled = match self.enable_lock.lock() {
                Ok(guard) => *guard,
                Err(_) => {
                    drop(frame);
                    break;
                }
            };
            drop(frame);
            if !enabled {
                break;
            }
        }

        if self.verbose.load(Ordering::Relaxed) {
            log::debug!("GVSP: receive loop exiting");
        }
    }

    /// C2 + C3: classify the packet and dispatch to the matching handler.
    fn dispatch(&self, frame: &mut FrameState, datagram: &[u8]) {
        let header = match PacketHeader::parse(datagram) {
            Ok(header) => header,
            Err(e) => {
                if self.warnings.load(Ordering::Relaxed) {
                    log::warn!("GVSP: {e}");
                }
                return;
            }
        };

        if !header.status.is_ok() {
            if self.warnings.load(Ordering::Relaxed) {
                log::warn!("GVSP: packet status {:#06x}", header.status.0);
            }
            return;
        }
        if header.block_id == 0 {
            return;
        }
        if header.extended_id {
            if self.warnings.load(Ordering::Relaxed) {
                log::warn!("GVSP: extended packet IDs are not supported");
            }
            return;
        }

        match header.format {
            PacketFormat::Leader => {
                self.handle_leader(frame, PacketHeader::payload(datagram));
            }
            PacketFormat::Data => {
                self.handle_data(frame, header.packet_id, datagram);
            }
            PacketFormat::Trailer => {
                self.handle_trailer(frame, PacketHeader::payload(datagram));
            }
            PacketFormat::Other(_) => {}
        }
    }

    fn handle_leader(&self, frame: &mut FrameState, content: &[u8]) {
        match ImageLeader::parse(content) {
            Ok(leader) => {
                frame.pixel_format = Some(leader.pixel_format);
                frame.size_x = leader.size_x;
                frame.size_y = leader.size_y;
                frame.received_packets = 0;
                frame.leader_received = true;
            }
            Err(e) => {
                if self.warnings.load(Ordering::Relaxed) {
                    log::warn!("GVSP: invalid leader: {e}");
                }
            }
        }
    }

    fn handle_data(&self, frame: &mut FrameState, packet_id: u32, datagram: &[u8]) {
        if !frame.leader_received {
            return;
        }

        let packet_payload_size = frame.packet_payload_size;
        if protocol::GVSP_HEADER_SIZE + packet_payload_size > datagram.len() {
            if self.warnings.load(Ordering::Relaxed) {
                log::warn!(
                    "GVSP: short data packet: need {} bytes, got {}",
                    protocol::GVSP_HEADER_SIZE + packet_payload_size,
                    datagram.len()
                );
            }
            return;
        }
        if packet_id == 0 {
            if self.warnings.load(Ordering::Relaxed) {
                log::warn!("GVSP: data packet id is zero");
            }
            return;
        }

        let start = (packet_id as usize - 1) * packet_payload_size;
        let end = start + packet_payload_size;
        let Some(buffer) = frame.frame_buffer.as_mut() else {
            return;
        };
        if end > buffer.len() {
            if self.warnings.load(Ordering::Relaxed) {
                log::warn!("GVSP: data packet {packet_id} overflows frame buffer ({end} > {})", buffer.len());
            }
            return;
        }

        let payload = PacketHeader::payload(datagram);
        buffer[start..end].copy_from_slice(&payload[..packet_payload_size]);
        frame.received_packets += 1;
    }

    fn handle_trailer(&self, frame: &mut FrameState, content: &[u8]) {
        if !frame.leader_received {
            if self.warnings.load(Ordering::Relaxed) {
                log::warn!("GVSP: Trailer received before leader");
            }
            return;
        }
        frame.leader_received = false;

        if content.len() < protocol::MIN_LEADER_TRAILER_CONTENT {
            if self.warnings.load(Ordering::Relaxed) {
                log::warn!("GVSP: short trailer payload ({} bytes)", content.len());
            }
            return;
        }

        if frame.received_packets != frame.packet_count {
            if self.warnings.load(Ordering::Relaxed) {
                log::warn!(
                    "GVSP: {} packets dropped",
                    frame.packet_count.saturating_sub(frame.received_packets)
                );
            }
            return;
        }

        let Some(pixel_format) = frame.pixel_format else {
            return;
        };
        let Some(buffer) = frame.frame_buffer.as_ref() else {
            return;
        };

        match decode::decode(pixel_format, buffer, frame.size_x, frame.size_y) {
            Ok((pixels, bit_depth)) => {
                let delivered = Frame {
                    pixels,
                    bit_depth,
                    size_x: frame.size_x,
                    size_y: frame.size_y,
                };
                if let Some(callback) = frame.frame_callback.as_mut() {
                    callback.on_frame(delivered);
                }
            }
            Err(e) => {
                if self.warnings.load(Ordering::Relaxed) {
                    log::warn!("GVSP: failed to decode frame: {e}");
                }
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if matches!(self.is_receiving(), Ok(true)) {
            if let Err(e) = self.stop_receive() {
                log::error!("GVSP: failed to stop receive loop while dropping receiver: {e}");
            }
        }
    }
}
