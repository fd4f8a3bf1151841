//! Error types for tinymq.

use std::io;

use thiserror::Error;

/// Main error type for tinymq.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// MQTT protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Reserved fixed-header flags: type {packet_type:#x}, flags {flags:#04x}")]
    ReservedFlags { packet_type: u8, flags: u8 },

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Packet too large: {size} bytes exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid protocol name: expected 'MQTT', got '{0}'")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("First packet must be CONNECT")]
    FirstPacketNotConnect,
}

pub type Result<T> = std::result::Result<T, Error>;
