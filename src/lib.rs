//! tinymq - a lightweight single-threaded MQTT 5.0 broker.

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod prometheus;
pub mod retained;
pub mod server;
pub mod subscription;
