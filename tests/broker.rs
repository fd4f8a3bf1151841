//! End-to-end broker tests over real sockets.
//!
//! Each test starts a broker on an ephemeral port and speaks raw MQTT 5.0
//! bytes to it, asserting on the exact reply frames.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tinymq::config::Config;
use tinymq::metrics::BrokerMetrics;
use tinymq::server::Server;

/// A well-formed v5 CONNECT: clean start, keep-alive 60, empty client id.
const CONNECT: &[u8] = &[
    0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C, 0x00, 0x00, 0x00,
];

/// The success CONNACK the broker replies with.
const CONNACK_OK: &[u8] = &[0x20, 0x03, 0x00, 0x00, 0x00];

struct Broker {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
}

impl Broker {
    fn start() -> Self {
        let config = Config::parse("[server]\nbind = \"127.0.0.1:0\"\n").unwrap();
        let metrics = Arc::new(BrokerMetrics::new());
        let running = Arc::new(AtomicBool::new(true));
        let mut server = Server::new(Arc::new(config), metrics, running.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run().unwrap());
        Self { addr, running }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    /// Open a TCP session without sending anything.
    fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { stream }
    }

    /// Open a session and complete the CONNECT/CONNACK handshake.
    fn connect(addr: SocketAddr) -> Self {
        let mut client = Self::open(addr);
        client.send(CONNECT);
        assert_eq!(client.read_packet(), CONNACK_OK);
        client
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Read exactly one MQTT packet (fixed header + remaining length body).
    fn read_packet(&mut self) -> Vec<u8> {
        let mut packet = vec![0u8; 1];
        self.stream.read_exact(&mut packet).unwrap();

        // Remaining length, one VBI byte at a time.
        let mut remaining = 0usize;
        let mut multiplier = 1usize;
        loop {
            let mut byte = [0u8; 1];
            self.stream.read_exact(&mut byte).unwrap();
            packet.push(byte[0]);
            remaining += ((byte[0] & 0x7F) as usize) * multiplier;
            if byte[0] & 0x80 == 0 {
                break;
            }
            multiplier *= 128;
        }

        let start = packet.len();
        packet.resize(start + remaining, 0);
        self.stream.read_exact(&mut packet[start..]).unwrap();
        packet
    }

    /// Assert nothing arrives within a short window.
    fn expect_silence(&mut self) {
        self.stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => panic!("connection closed while expecting silence"),
            Ok(_) => panic!("unexpected data while expecting silence"),
            Err(e) => assert!(
                matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ),
                "unexpected error: {}",
                e
            ),
        }
        self.stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
    }

    /// Assert the broker closed the connection.
    fn expect_closed(&mut self) {
        let mut buf = [0u8; 16];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue, // drain anything in flight
                Err(e) => panic!("expected EOF, got error: {}", e),
            }
        }
    }

    /// PINGREQ/PINGRESP round trip, used to fence earlier packets: once the
    /// response arrives, everything sent before the ping has been handled.
    fn ping_fence(&mut self) {
        self.send(&[0xC0, 0x00]);
        assert_eq!(self.read_packet(), vec![0xD0, 0x00]);
    }
}

fn subscribe_bytes(packet_id: u16, filter: &str, qos: u8) -> Vec<u8> {
    let mut buf = vec![0x82];
    let remaining = 2 + 1 + 2 + filter.len() + 1;
    buf.push(remaining as u8);
    buf.extend_from_slice(&packet_id.to_be_bytes());
    buf.push(0x00); // properties
    buf.extend_from_slice(&(filter.len() as u16).to_be_bytes());
    buf.extend_from_slice(filter.as_bytes());
    buf.push(qos);
    buf
}

fn publish_bytes(topic: &str, payload: &[u8], qos: u8, retain: bool, packet_id: u16) -> Vec<u8> {
    let mut header = 0x30u8;
    header |= qos << 1;
    if retain {
        header |= 0x01;
    }
    let mut buf = vec![header];
    let pid_len = if qos > 0 { 2 } else { 0 };
    let remaining = 2 + topic.len() + pid_len + 1 + payload.len();
    buf.push(remaining as u8);
    buf.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    buf.extend_from_slice(topic.as_bytes());
    if qos > 0 {
        buf.extend_from_slice(&packet_id.to_be_bytes());
    }
    buf.push(0x00); // properties
    buf.extend_from_slice(payload);
    buf
}

#[test]
fn connect_returns_connack() {
    let broker = Broker::start();
    let mut client = TestClient::open(broker.addr);
    client.send(CONNECT);
    assert_eq!(client.read_packet(), CONNACK_OK);
}

#[test]
fn subscribe_returns_suback() {
    let broker = Broker::start();
    let mut client = TestClient::connect(broker.addr);

    client.send(&subscribe_bytes(1, "a/b", 0));
    assert_eq!(client.read_packet(), vec![0x90, 0x04, 0x00, 0x01, 0x00, 0x00]);
}

#[test]
fn publish_fans_out_to_all_subscribers() {
    let broker = Broker::start();
    let mut sub_a = TestClient::connect(broker.addr);
    let mut sub_b = TestClient::connect(broker.addr);
    let mut publisher = TestClient::connect(broker.addr);

    sub_a.send(&subscribe_bytes(1, "x", 0));
    sub_a.read_packet(); // SUBACK
    sub_b.send(&subscribe_bytes(1, "x", 0));
    sub_b.read_packet(); // SUBACK

    publisher.send(&publish_bytes("x", b"hi", 0, false, 0));

    let expected = vec![0x30, 0x06, 0x00, 0x01, b'x', 0x00, b'h', b'i'];
    assert_eq!(sub_a.read_packet(), expected);
    assert_eq!(sub_b.read_packet(), expected);
    // The publisher itself is not subscribed and receives nothing.
    publisher.expect_silence();
}

#[test]
fn retained_message_delivered_on_late_subscribe() {
    let broker = Broker::start();
    let mut publisher = TestClient::connect(broker.addr);
    publisher.send(&publish_bytes("y", b"v", 0, true, 0));
    publisher.ping_fence();

    let mut subscriber = TestClient::connect(broker.addr);
    subscriber.send(&subscribe_bytes(3, "y", 0));

    // Retained copy (retain flag set) arrives ahead of the SUBACK.
    assert_eq!(
        subscriber.read_packet(),
        vec![0x31, 0x05, 0x00, 0x01, b'y', 0x00, b'v']
    );
    assert_eq!(
        subscriber.read_packet(),
        vec![0x90, 0x04, 0x00, 0x03, 0x00, 0x00]
    );
}

#[test]
fn empty_retained_payload_clears_entry() {
    let broker = Broker::start();
    let mut publisher = TestClient::connect(broker.addr);
    publisher.send(&publish_bytes("y", b"v", 0, true, 0));
    publisher.send(&publish_bytes("y", b"", 0, true, 0));
    publisher.ping_fence();

    let mut subscriber = TestClient::connect(broker.addr);
    subscriber.send(&subscribe_bytes(4, "y", 0));

    // Only the SUBACK; no retained delivery.
    assert_eq!(
        subscriber.read_packet(),
        vec![0x90, 0x04, 0x00, 0x04, 0x00, 0x00]
    );
    subscriber.expect_silence();
}

#[test]
fn qos1_publish_is_acknowledged() {
    let broker = Broker::start();
    let mut client = TestClient::connect(broker.addr);

    client.send(&publish_bytes("t", b"p", 1, false, 42));
    assert_eq!(client.read_packet(), vec![0x40, 0x04, 0x00, 0x2A, 0x00, 0x00]);
}

#[test]
fn subscribing_twice_delivers_once() {
    let broker = Broker::start();
    let mut subscriber = TestClient::connect(broker.addr);
    let mut publisher = TestClient::connect(broker.addr);

    subscriber.send(&subscribe_bytes(1, "t", 0));
    subscriber.read_packet(); // SUBACK
    subscriber.send(&subscribe_bytes(2, "t", 0));
    subscriber.read_packet(); // SUBACK

    publisher.send(&publish_bytes("t", b"once", 0, false, 0));

    assert_eq!(
        subscriber.read_packet(),
        vec![0x30, 0x08, 0x00, 0x01, b't', 0x00, b'o', b'n', b'c', b'e']
    );
    subscriber.expect_silence();
}

#[test]
fn forwarded_qos_is_clamped_to_subscription() {
    let broker = Broker::start();
    let mut subscriber = TestClient::connect(broker.addr);
    let mut publisher = TestClient::connect(broker.addr);

    subscriber.send(&subscribe_bytes(1, "t", 0));
    subscriber.read_packet(); // SUBACK

    publisher.send(&publish_bytes("t", b"p", 1, false, 7));
    assert_eq!(
        publisher.read_packet(),
        vec![0x40, 0x04, 0x00, 0x07, 0x00, 0x00]
    );

    // Subscriber asked for QoS 0, so the copy arrives without a packet id.
    assert_eq!(
        subscriber.read_packet(),
        vec![0x30, 0x05, 0x00, 0x01, b't', 0x00, b'p']
    );
}

#[test]
fn unsubscribe_reports_missing_subscriptions() {
    let broker = Broker::start();
    let mut client = TestClient::connect(broker.addr);

    client.send(&subscribe_bytes(1, "t", 0));
    client.read_packet(); // SUBACK

    // UNSUBSCRIBE "t" and "other"; only "t" existed.
    let mut unsub = vec![0xA2];
    let remaining = 2 + 1 + (2 + 1) + (2 + 5);
    unsub.push(remaining as u8);
    unsub.extend_from_slice(&9u16.to_be_bytes());
    unsub.push(0x00); // properties
    unsub.extend_from_slice(&[0x00, 0x01, b't']);
    unsub.extend_from_slice(&[0x00, 0x05]);
    unsub.extend_from_slice(b"other");
    client.send(&unsub);

    assert_eq!(
        client.read_packet(),
        vec![0xB0, 0x05, 0x00, 0x09, 0x00, 0x00, 0x11]
    );
}

#[test]
fn unsubscribed_client_stops_receiving() {
    let broker = Broker::start();
    let mut subscriber = TestClient::connect(broker.addr);
    let mut publisher = TestClient::connect(broker.addr);

    subscriber.send(&subscribe_bytes(1, "t", 0));
    subscriber.read_packet(); // SUBACK

    let mut unsub = vec![0xA2, 0x06];
    unsub.extend_from_slice(&2u16.to_be_bytes());
    unsub.push(0x00);
    unsub.extend_from_slice(&[0x00, 0x01, b't']);
    subscriber.send(&unsub);
    subscriber.read_packet(); // UNSUBACK

    publisher.send(&publish_bytes("t", b"p", 0, false, 0));
    publisher.ping_fence();
    subscriber.expect_silence();
}

#[test]
fn pingreq_gets_pingresp() {
    let broker = Broker::start();
    let mut client = TestClient::connect(broker.addr);
    client.send(&[0xC0, 0x00]);
    assert_eq!(client.read_packet(), vec![0xD0, 0x00]);
}

#[test]
fn packet_before_connect_closes_connection() {
    let broker = Broker::start();
    let mut client = TestClient::open(broker.addr);
    client.send(&[0xC0, 0x00]); // PINGREQ without CONNECT
    client.expect_closed();
}

#[test]
fn malformed_connect_gets_error_connack() {
    let broker = Broker::start();
    let mut client = TestClient::open(broker.addr);
    // Remaining length cuts the client id short (a classic v4-length frame).
    client.send(&[
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C, 0x00, 0x00,
    ]);
    assert_eq!(client.read_packet(), vec![0x20, 0x03, 0x00, 0x80, 0x00]);
    client.expect_closed();
}

#[test]
fn disconnect_cleans_up_subscriptions() {
    let broker = Broker::start();
    let mut subscriber = TestClient::connect(broker.addr);
    let mut publisher = TestClient::connect(broker.addr);

    subscriber.send(&subscribe_bytes(1, "t", 0));
    subscriber.read_packet(); // SUBACK
    subscriber.send(&[0xE0, 0x00]); // DISCONNECT
    subscriber.expect_closed();

    // Fan-out to the departed subscriber must not blow up or leak.
    publisher.send(&publish_bytes("t", b"p", 0, false, 0));
    publisher.ping_fence();
}

#[test]
fn packets_split_across_tcp_segments_are_reassembled() {
    let broker = Broker::start();
    let mut client = TestClient::open(broker.addr);

    // Dribble the CONNECT one byte at a time.
    for &byte in CONNECT {
        client.send(&[byte]);
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(client.read_packet(), CONNACK_OK);

    // Two packets in a single write: PINGREQ + PINGREQ.
    client.send(&[0xC0, 0x00, 0xC0, 0x00]);
    assert_eq!(client.read_packet(), vec![0xD0, 0x00]);
    assert_eq!(client.read_packet(), vec![0xD0, 0x00]);
}

#[test]
fn unknown_packet_type_is_ignored() {
    let broker = Broker::start();
    let mut client = TestClient::connect(broker.addr);

    // Type nibble 0 is reserved; the broker skips it and stays up.
    client.send(&[0x00, 0x00]);
    client.ping_fence();
}
