//! MQTT packet types and codec for MQTT 5.0.
//!
//! The only module that touches raw wire bytes. Inbound property blocks are
//! skipped opaquely by their declared length; outbound packets carry an empty
//! property block.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

/// Maximum value encodable as a variable byte integer (MQTT 1.5.5).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            15 => Ok(PacketType::Auth),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid QoS: {}",
                value
            ))),
        }
    }
}

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(Puback),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(Unsuback),
    Pingreq,
    Pingresp,
    Disconnect { reason_code: u8 },
    /// Recognized on the wire but not acted on by this broker
    /// (PUBREC, PUBREL, PUBCOMP, AUTH).
    Unhandled(PacketType),
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Will message carried by CONNECT. Parsed for wire compatibility; this
/// broker does not publish wills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub reason_code: u8,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// PUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Puback {
    pub packet_id: u16,
    pub reason_code: u8,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// UNSUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsuback {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
}

/// Decoder cursor over one packet's variable header + payload.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            }
            .into());
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // MQTT-1.5.4-2: UTF-8 string MUST NOT contain null character U+0000
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            )
            .into());
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(bytes.to_vec())
    }

    /// Read a Variable Byte Integer (MQTT 1.5.5).
    fn read_variable_byte_integer(&mut self) -> Result<u32> {
        let mut multiplier = 1u32;
        let mut value = 0u32;

        loop {
            if self.pos >= self.buf.len() {
                return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 }.into());
            }

            let byte = self.buf[self.pos];
            self.pos += 1;

            value += ((byte & 0x7F) as u32) * multiplier;

            if multiplier > 128 * 128 * 128 {
                return Err(ProtocolError::InvalidRemainingLength.into());
            }

            if (byte & 0x80) == 0 {
                return Ok(value);
            }

            multiplier *= 128;
        }
    }

    /// Skip an MQTT 5 property block: VBI length plus that many bytes.
    fn skip_properties(&mut self) -> Result<()> {
        let len = self.read_variable_byte_integer()? as usize;
        self.read_bytes(len)?;
        Ok(())
    }
}

/// Decode the remaining length field (variable length encoding).
/// Returns (length, bytes_consumed) or None if more bytes are needed.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        value += ((byte & 0x7F) as usize) * multiplier;

        if multiplier > 128 * 128 * 128 {
            return Err(ProtocolError::InvalidRemainingLength.into());
        }

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    // Need more bytes
    Ok(None)
}

/// Encode a remaining length into `buf` (at least 4 bytes). Returns bytes
/// written, or an error when the value cannot be represented in 4 bytes.
pub fn encode_remaining_length(mut len: usize, buf: &mut [u8]) -> Result<usize> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::InvalidRemainingLength.into());
    }
    let mut i = 0;
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf[i] = byte;
        i += 1;
        if len == 0 {
            break;
        }
    }
    Ok(i)
}

/// Total wire span (fixed header + remaining length) of the packet at the
/// start of `buf`, if the length field is complete and valid.
pub fn packet_span(buf: &[u8]) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    match decode_remaining_length(&buf[1..]) {
        Ok(Some((remaining_len, len_bytes))) => Some(1 + len_bytes + remaining_len),
        _ => None,
    }
}

/// Try to decode a complete packet from the buffer.
/// Returns Ok(Some((packet, bytes_consumed))) if successful,
/// Ok(None) if more data is needed, or Err on protocol errors.
/// max_packet_size: maximum allowed total packet size (0 = no limit).
pub fn decode_packet(buf: &[u8], max_packet_size: u32) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type_raw = fixed_header >> 4;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if max_packet_size > 0 && total_len > max_packet_size as usize {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size as usize,
        }
        .into());
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(packet_type_raw)?;
    let payload = &buf[header_len..total_len];

    // Fixed-header flag validation.
    // MQTT-3.8.1-1 / MQTT-3.10.1-1 / MQTT-3.6.1-1: SUBSCRIBE, UNSUBSCRIBE
    // and PUBREL require flags 0010; everything except PUBLISH reserves 0000.
    match packet_type {
        PacketType::Subscribe | PacketType::Unsubscribe | PacketType::Pubrel => {
            if flags != 0x02 {
                return Err(ProtocolError::ReservedFlags {
                    packet_type: packet_type_raw,
                    flags,
                }
                .into());
            }
        }
        PacketType::Publish => {}
        _ => {
            if flags != 0x00 {
                return Err(ProtocolError::ReservedFlags {
                    packet_type: packet_type_raw,
                    flags,
                }
                .into());
            }
        }
    }

    let packet = match packet_type {
        PacketType::Connect => decode_connect(payload)?,
        PacketType::Connack => decode_connack(payload)?,
        PacketType::Publish => decode_publish(flags, payload)?,
        PacketType::Puback => decode_puback(payload)?,
        PacketType::Subscribe => decode_subscribe(payload)?,
        PacketType::Suback => decode_suback(payload)?,
        PacketType::Unsubscribe => decode_unsubscribe(payload)?,
        PacketType::Unsuback => decode_unsuback(payload)?,
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => decode_disconnect(payload)?,
        PacketType::Pubrec | PacketType::Pubrel | PacketType::Pubcomp | PacketType::Auth => {
            Packet::Unhandled(packet_type)
        }
    };

    Ok(Some((packet, total_len)))
}

/// Reject topic names (not filters) that are empty or contain wildcards.
/// MQTT-3.3.2-2, MQTT-4.7.3-1.
fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ProtocolError::MalformedPacket("empty topic name".into()).into());
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(
            ProtocolError::MalformedPacket(format!("wildcard in topic name '{}'", topic)).into(),
        );
    }
    Ok(())
}

fn decode_connect(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);

    let protocol_name = dec.read_string()?;
    if protocol_name != "MQTT" {
        return Err(ProtocolError::InvalidProtocolName(protocol_name).into());
    }

    let protocol_version = dec.read_u8()?;
    if protocol_version != 5 {
        return Err(ProtocolError::UnsupportedProtocolVersion(protocol_version).into());
    }

    let flags = dec.read_u8()?;
    let clean_start = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // MQTT-3.1.2-3: reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    // MQTT-3.1.2-11: if Will Flag is 0, Will QoS must be 0
    if !will_flag && will_qos != QoS::AtMostOnce {
        return Err(ProtocolError::MalformedPacket(
            "Will QoS must be 0 when Will Flag is 0".into(),
        )
        .into());
    }

    // MQTT-3.1.2-13: if Will Flag is 0, Will Retain must be 0
    if !will_flag && will_retain {
        return Err(ProtocolError::MalformedPacket(
            "Will Retain must be 0 when Will Flag is 0".into(),
        )
        .into());
    }

    let keep_alive = dec.read_u16()?;

    dec.skip_properties()?;

    let client_id = dec.read_string()?;

    let will = if will_flag {
        dec.skip_properties()?;
        let topic = dec.read_string()?;
        let message = dec.read_binary()?;
        Some(Will {
            topic,
            message,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_version,
        clean_start,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let session_present = (dec.read_u8()? & 0x01) != 0;
    let reason_code = dec.read_u8()?;
    if dec.remaining() > 0 {
        dec.skip_properties()?;
    }
    Ok(Packet::Connack(Connack {
        session_present,
        reason_code,
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(payload);

    let topic = dec.read_string()?;
    validate_topic_name(&topic)?;

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_u16()?)
    } else {
        None
    };

    dec.skip_properties()?;

    // Everything after the property block is application payload.
    let payload_data = dec.read_bytes(dec.remaining())?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(payload_data),
    }))
}

fn decode_puback(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;
    // MQTT-3.4.2.1: remaining length 2 means success with no properties.
    let reason_code = if dec.remaining() > 0 { dec.read_u8()? } else { 0 };
    Ok(Packet::Puback(Puback {
        packet_id,
        reason_code,
    }))
}

fn decode_subscribe(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);

    let packet_id = dec.read_u16()?;
    // MQTT-2.2.1-2: SUBSCRIBE packet identifier must be nonzero
    if packet_id == 0 {
        return Err(ProtocolError::MalformedPacket("zero packet identifier".into()).into());
    }

    dec.skip_properties()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;

        // MQTT-4.7.3-1: topic filter must be at least 1 character
        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket("empty topic filter".into()).into());
        }

        let qos = QoS::try_from(dec.read_u8()? & 0x03)?;
        topics.push((filter, qos));
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;
    dec.skip_properties()?;
    let reason_codes = dec.read_bytes(dec.remaining())?.to_vec();
    Ok(Packet::Suback(Suback {
        packet_id,
        reason_codes,
    }))
}

fn decode_unsubscribe(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);

    let packet_id = dec.read_u16()?;

    dec.skip_properties()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;

        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket("empty topic filter".into()).into());
        }

        topics.push(filter);
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("UNSUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}

fn decode_unsuback(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;
    dec.skip_properties()?;
    let reason_codes = dec.read_bytes(dec.remaining())?.to_vec();
    Ok(Packet::Unsuback(Unsuback {
        packet_id,
        reason_codes,
    }))
}

fn decode_disconnect(payload: &[u8]) -> Result<Packet> {
    // MQTT-3.14.2.1: remaining length 0 means normal disconnection.
    if payload.is_empty() {
        return Ok(Packet::Disconnect { reason_code: 0 });
    }
    let mut dec = Decoder::new(payload);
    let reason_code = dec.read_u8()?;
    if dec.remaining() > 0 {
        dec.skip_properties()?;
    }
    Ok(Packet::Disconnect { reason_code })
}

/// Encode a packet into the provided buffer.
///
/// Only server-to-client packets are encodable; an encode failure here means
/// a handler built an impossible packet from in-memory values.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) -> Result<()> {
    match packet {
        Packet::Connack(connack) => encode_connack(connack, buf),
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::Puback(puback) => encode_puback(puback, buf),
        Packet::Suback(suback) => encode_suback(suback, buf),
        Packet::Unsuback(unsuback) => encode_unsuback(unsuback, buf),
        Packet::Pingresp => encode_pingresp(buf),
        Packet::Disconnect { reason_code } => encode_disconnect(*reason_code, buf),
        _ => Ok(()), // client-only packets, never built by the broker
    }
}

fn push_remaining_length(len: usize, buf: &mut Vec<u8>) -> Result<()> {
    let mut len_buf = [0u8; 4];
    let len_bytes = encode_remaining_length(len, &mut len_buf)?;
    buf.extend_from_slice(&len_buf[..len_bytes]);
    Ok(())
}

fn encode_connack(connack: &Connack, buf: &mut Vec<u8>) -> Result<()> {
    buf.push((PacketType::Connack as u8) << 4);
    buf.push(3); // Remaining length
    buf.push(if connack.session_present { 1 } else { 0 });
    buf.push(connack.reason_code);
    buf.push(0); // Property length
    Ok(())
}

fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) -> Result<()> {
    let mut fixed_header = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed_header |= 0x08;
    }
    fixed_header |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed_header |= 0x01;
    }
    buf.push(fixed_header);

    let topic_len = 2 + publish.topic.len();
    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining = topic_len + packet_id_len + 1 + publish.payload.len();
    push_remaining_length(remaining, buf)?;

    buf.extend_from_slice(&(publish.topic.len() as u16).to_be_bytes());
    buf.extend_from_slice(publish.topic.as_bytes());

    if publish.qos != QoS::AtMostOnce {
        buf.extend_from_slice(&publish.packet_id.unwrap_or(0).to_be_bytes());
    }

    buf.push(0); // Property length

    buf.extend_from_slice(&publish.payload);
    Ok(())
}

fn encode_puback(puback: &Puback, buf: &mut Vec<u8>) -> Result<()> {
    buf.push((PacketType::Puback as u8) << 4);
    buf.push(4); // Remaining length
    buf.extend_from_slice(&puback.packet_id.to_be_bytes());
    buf.push(puback.reason_code);
    buf.push(0); // Property length
    Ok(())
}

fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) -> Result<()> {
    buf.push((PacketType::Suback as u8) << 4);
    push_remaining_length(2 + 1 + suback.reason_codes.len(), buf)?;
    buf.extend_from_slice(&suback.packet_id.to_be_bytes());
    buf.push(0); // Property length
    buf.extend_from_slice(&suback.reason_codes);
    Ok(())
}

fn encode_unsuback(unsuback: &Unsuback, buf: &mut Vec<u8>) -> Result<()> {
    buf.push((PacketType::Unsuback as u8) << 4);
    push_remaining_length(2 + 1 + unsuback.reason_codes.len(), buf)?;
    buf.extend_from_slice(&unsuback.packet_id.to_be_bytes());
    buf.push(0); // Property length
    buf.extend_from_slice(&unsuback.reason_codes);
    Ok(())
}

fn encode_pingresp(buf: &mut Vec<u8>) -> Result<()> {
    buf.push((PacketType::Pingresp as u8) << 4);
    buf.push(0); // Remaining length
    Ok(())
}

fn encode_disconnect(reason_code: u8, buf: &mut Vec<u8>) -> Result<()> {
    buf.push((PacketType::Disconnect as u8) << 4);
    buf.push(2); // Remaining length
    buf.push(reason_code);
    buf.push(0); // Property length
    Ok(())
}
