//! Per-client connection state and buffer management.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use ahash::AHashMap;
use log::debug;
use mio::net::TcpStream;
use mio::Token;

use crate::error::{Error, ProtocolError, Result};
use crate::packet::{self, Packet};

/// Initial read buffer size.
const INITIAL_BUFFER_SIZE: usize = 1024;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Waiting for the CONNECT packet.
    Connecting,
    /// CONNECT accepted, session established.
    Connected,
    /// Marked for cleanup on the next loop tick.
    Disconnecting,
}

/// Per-client state and buffers.
pub struct Client {
    pub token: Token,
    pub socket: TcpStream,
    pub addr: SocketAddr,
    pub state: ClientState,
    pub client_id: Option<String>,
    pub keep_alive: u16,

    /// Last time any packet was received from this client.
    pub last_packet_time: Instant,

    /// Outgoing QoS 1 copies awaiting PUBACK, by packet id (send time kept).
    pub pending_qos1: AHashMap<u16, Instant>,

    /// Next packet ID for outgoing QoS 1 messages (1-65535, 0 is invalid).
    next_packet_id: u16,

    /// True once any byte has arrived. Port scanners open and close sockets
    /// without sending; those get debug-level logs instead of info.
    has_received_data: bool,

    /// The peer sent FIN. Buffered packets are still processed; the server
    /// marks the client disconnecting once the buffer is drained.
    peer_closed: bool,

    read_buf: Vec<u8>,
    read_pos: usize,

    write_buf: Vec<u8>,
    write_pos: usize,
}

impl Client {
    pub fn new(token: Token, socket: TcpStream, addr: SocketAddr) -> Self {
        Self {
            token,
            socket,
            addr,
            state: ClientState::Connecting,
            client_id: None,
            keep_alive: 0,
            last_packet_time: Instant::now(),
            pending_qos1: AHashMap::new(),
            next_packet_id: 1,
            has_received_data: false,
            peer_closed: false,
            read_buf: vec![0u8; INITIAL_BUFFER_SIZE],
            read_pos: 0,
            write_buf: Vec::new(),
            write_pos: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state != ClientState::Disconnecting
    }

    pub fn has_received_data(&self) -> bool {
        self.has_received_data
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Drain available bytes from the socket into the read buffer.
    /// Returns the number of bytes read this call; EOF sets `peer_closed`.
    pub fn read(&mut self) -> Result<usize> {
        let mut total = 0usize;
        loop {
            if self.read_pos >= self.read_buf.len() {
                let new_size = self.read_buf.len() * 2;
                self.read_buf.resize(new_size, 0);
            }

            match self.socket.read(&mut self.read_buf[self.read_pos..]) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(total);
                }
                Ok(n) => {
                    self.read_pos += n;
                    total += n;
                    self.has_received_data = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(total);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = ClientState::Disconnecting;
                    return Err(e.into());
                }
            }
        }
    }

    /// Extract the next complete packet from the read buffer.
    ///
    /// Packets with an unknown type nibble or reserved-flag violations are
    /// skipped in place (logged, connection kept) per the broker's
    /// best-effort tolerance; all other codec errors propagate.
    pub fn next_packet(&mut self, max_packet_size: u32) -> Result<Option<Packet>> {
        loop {
            if self.read_pos == 0 {
                return Ok(None);
            }

            let data = &self.read_buf[..self.read_pos];
            match packet::decode_packet(data, max_packet_size) {
                Ok(Some((packet, consumed))) => {
                    self.consume(consumed);
                    self.last_packet_time = Instant::now();
                    return Ok(Some(packet));
                }
                Ok(None) => return Ok(None),
                Err(Error::Protocol(
                    ref e @ (ProtocolError::InvalidPacketType(_)
                    | ProtocolError::ReservedFlags { .. }),
                )) => {
                    // The type/flag checks only run once the whole packet is
                    // buffered, so its span is always computable here.
                    let span = packet::packet_span(data).unwrap_or(self.read_pos);
                    debug!("client {:?}: skipping {} byte packet: {}", self.token, span, e);
                    self.consume(span);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.read_buf.copy_within(n..self.read_pos, 0);
        self.read_pos -= n;
    }

    /// Get the next packet ID, wrapping from 65535 to 1 (0 is invalid).
    pub fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = if id == 65535 { 1 } else { id + 1 };
        id
    }

    /// Encode a packet onto the write queue. Returns the encoded size.
    pub fn queue_packet(&mut self, packet: &Packet) -> Result<usize> {
        let start = self.write_buf.len();
        packet::encode_packet(packet, &mut self.write_buf)?;
        Ok(self.write_buf.len() - start)
    }

    /// Write queued data to the socket.
    /// Returns Ok(true) once the queue is drained, Ok(false) on WouldBlock.
    pub fn flush(&mut self) -> Result<bool> {
        while self.write_pos < self.write_buf.len() {
            match self.socket.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => {
                    self.state = ClientState::Disconnecting;
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = ClientState::Disconnecting;
                    return Err(e.into());
                }
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Ok(true)
    }

    pub fn has_pending_writes(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }
}
