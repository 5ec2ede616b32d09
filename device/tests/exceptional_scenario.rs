//! Exercises spec scenarios S5/S6 and the lifecycle error taxonomy: bad
//! packet/payload size ratios, double-buffer/no-buffer/no-socket, and the
//! `AlreadyReceiving`/`NotReceiving` state guards.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::time::Duration;

use gvsp_device::gige::receiver::{Frame, FrameCallback, Receiver};
use gvsp_device::gige::Error;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const PACKET_OVERHEAD: usize = 36;

struct ChannelCallback(mpsc::Sender<Frame>);

impl FrameCallback for ChannelCallback {
    fn on_frame(&mut self, frame: Frame) {
        self.0.send(frame).ok();
    }
}

fn header(status: u16, block_id: u16, format: u8, packet_id: u32) -> Vec<u8> {
    let mut v = Vec::with_capacity(8);
    v.extend_from_slice(&status.to_be_bytes());
    v.extend_from_slice(&block_id.to_be_bytes());
    let word = ((format as u32) << 24) | (packet_id & 0x00ff_ffff);
    v.extend_from_slice(&word.to_be_bytes());
    v
}

fn leader(block_id: u16, pixel_format: u32, size_x: u32, size_y: u32) -> Vec<u8> {
    let mut v = header(0x0000, block_id, 1, 0);
    v.extend_from_slice(&[0x00, 0x00]);
    v.extend_from_slice(&0x0001u16.to_be_bytes());
    v.extend_from_slice(&0u64.to_be_bytes());
    v.extend_from_slice(&pixel_format.to_be_bytes());
    v.extend_from_slice(&size_x.to_be_bytes());
    v.extend_from_slice(&size_y.to_be_bytes());
    v.extend_from_slice(&0u32.to_be_bytes());
    v.extend_from_slice(&0u32.to_be_bytes());
    v.extend_from_slice(&0u16.to_be_bytes());
    v.extend_from_slice(&0u16.to_be_bytes());
    v
}

fn data(block_id: u16, packet_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut v = header(0x0000, block_id, 3, packet_id);
    v.extend_from_slice(payload);
    v
}

fn trailer(block_id: u16) -> Vec<u8> {
    let mut v = header(0x0000, block_id, 2, 0);
    v.extend_from_slice(&[0u8; 12]);
    v
}

fn harness(
    payload_size: usize,
    packet_payload_size: usize,
) -> (
    std::sync::Arc<Receiver>,
    UdpSocket,
    SocketAddr,
    mpsc::Receiver<Frame>,
) {
    let receiver = Receiver::create_socket(LOCALHOST).unwrap();
    receiver
        .create_buffer(payload_size, packet_payload_size + PACKET_OVERHEAD)
        .unwrap();

    let (tx, rx) = mpsc::channel();
    receiver
        .set_frame_callback(Some(Box::new(ChannelCallback(tx))))
        .unwrap();
    receiver.set_warnings(true);

    let camera = UdpSocket::bind((LOCALHOST, 0)).unwrap();
    let receiver_addr = SocketAddr::new(LOCALHOST, receiver.port().unwrap());
    receiver.start_receive(LOCALHOST).unwrap();

    (receiver, camera, receiver_addr, rx)
}

#[test]
fn s5_dropped_packet_suppresses_callback() {
    // Leader declares 4 data packets; packet 3 is never sent.
    let (receiver, camera, addr, rx) = harness(4, 1);

    camera.send_to(&leader(1, 0x0108_0001, 4, 1), addr).unwrap();
    camera.send_to(&data(1, 1, &[0xaa]), addr).unwrap();
    camera.send_to(&data(1, 2, &[0xbb]), addr).unwrap();
    camera.send_to(&data(1, 4, &[0xdd]), addr).unwrap();
    camera.send_to(&trailer(1), addr).unwrap();

    assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    receiver.stop_receive().unwrap();
}

#[test]
fn s6_stray_trailer_before_leader_is_ignored() {
    let (receiver, camera, addr, rx) = harness(4, 4);

    camera.send_to(&trailer(1), addr).unwrap();

    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    // Receiver is still usable afterwards: a subsequent well-formed frame
    // still delivers.
    camera.send_to(&leader(2, 0x0108_0001, 4, 1), addr).unwrap();
    camera
        .send_to(&data(2, 1, &[1, 2, 3, 4]), addr)
        .unwrap();
    camera.send_to(&trailer(2), addr).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(400)).is_ok());

    receiver.stop_receive().unwrap();
}

#[test]
fn duplicate_data_packets_overcount_and_drop_the_frame() {
    // packet_count = 1, but the single data packet is delivered twice: the
    // spec's default (no dedup) makes received_packets (2) != packet_count
    // (1), so the frame is dropped rather than delivered twice.
    let (receiver, camera, addr, rx) = harness(4, 4);

    camera.send_to(&leader(1, 0x0108_0001, 4, 1), addr).unwrap();
    camera
        .send_to(&data(1, 1, &[1, 2, 3, 4]), addr)
        .unwrap();
    camera
        .send_to(&data(1, 1, &[1, 2, 3, 4]), addr)
        .unwrap();
    camera.send_to(&trailer(1), addr).unwrap();

    assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    receiver.stop_receive().unwrap();
}

#[test]
fn unsupported_pixel_format_drops_the_frame() {
    let (receiver, camera, addr, rx) = harness(4, 4);

    // BayerRG8: a recognised GenICam code, not one of the six mono formats.
    camera.send_to(&leader(1, 0x0108_0009, 4, 1), addr).unwrap();
    camera
        .send_to(&data(1, 1, &[1, 2, 3, 4]), addr)
        .unwrap();
    camera.send_to(&trailer(1), addr).unwrap();

    assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    receiver.stop_receive().unwrap();
}

#[test]
fn zero_block_id_and_extended_id_and_bad_status_are_ignored() {
    let (receiver, camera, addr, rx) = harness(4, 4);

    let mut zero_block = leader(0, 0x0108_0001, 4, 1);
    zero_block[2..4].copy_from_slice(&0u16.to_be_bytes());
    camera.send_to(&zero_block, addr).unwrap();

    let mut extended = leader(1, 0x0108_0001, 4, 1);
    extended[4] |= 0x80;
    camera.send_to(&extended, addr).unwrap();

    let mut bad_status = leader(1, 0x0108_0001, 4, 1);
    bad_status[0..2].copy_from_slice(&0x8001u16.to_be_bytes());
    camera.send_to(&bad_status, addr).unwrap();

    // None of the above should have started a frame: a trailer now is
    // still "before leader".
    camera.send_to(&trailer(1), addr).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    receiver.stop_receive().unwrap();
}

#[test]
fn create_buffer_rejects_non_divisible_geometry() {
    let receiver = Receiver::create_socket(LOCALHOST).unwrap();
    let err = receiver.create_buffer(10, 40).unwrap_err();
    assert!(matches!(err, Error::InvalidPacketGeometry(_)));
}

#[test]
fn create_buffer_rejects_packet_size_below_overhead() {
    let receiver = Receiver::create_socket(LOCALHOST).unwrap();
    let err = receiver.create_buffer(4, 10).unwrap_err();
    assert!(matches!(err, Error::InvalidPacketGeometry(_)));
}

#[test]
fn lifecycle_state_errors() {
    let receiver = Receiver::create_socket(LOCALHOST).unwrap();

    // No buffer yet.
    assert!(matches!(receiver.free_buffer(), Err(Error::NoBuffer)));
    assert!(matches!(
        receiver.start_receive(LOCALHOST),
        Err(Error::NoBuffer)
    ));

    receiver.create_buffer(4, 40).unwrap();
    assert!(matches!(
        receiver.create_buffer(4, 40),
        Err(Error::BufferExists)
    ));

    receiver.start_receive(LOCALHOST).unwrap();
    assert!(matches!(
        receiver.start_receive(LOCALHOST),
        Err(Error::AlreadyReceiving)
    ));
    assert!(matches!(
        receiver.create_buffer(4, 40),
        Err(Error::AlreadyReceiving)
    ));
    assert!(matches!(
        receiver.free_buffer(),
        Err(Error::AlreadyReceiving)
    ));
    assert!(matches!(
        receiver.close_socket(),
        Err(Error::AlreadyReceiving)
    ));

    receiver.stop_receive().unwrap();
    assert!(matches!(receiver.stop_receive(), Err(Error::NotReceiving)));

    receiver.free_buffer().unwrap();
    receiver.close_socket().unwrap();
    assert!(matches!(receiver.close_socket(), Err(Error::NoSocket)));
}
