//! Retained message store.

use ahash::AHashMap;
use bytes::Bytes;

use crate::packet::QoS;

/// The last retained publish on a topic.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub payload: Bytes,
    pub qos: QoS,
}

/// Topic name -> last retained message. Last writer wins; an empty payload
/// published with RETAIN set clears the entry (MQTT-3.3.1-6).
#[derive(Default)]
pub struct RetainedStore {
    messages: AHashMap<String, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, topic: &str, payload: Bytes, qos: QoS) {
        self.messages
            .insert(topic.to_string(), RetainedMessage { payload, qos });
    }

    pub fn get(&self, topic: &str) -> Option<&RetainedMessage> {
        self.messages.get(topic)
    }

    pub fn clear(&mut self, topic: &str) {
        self.messages.remove(topic);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_overwrites() {
        let mut store = RetainedStore::new();
        store.put("t", Bytes::from_static(b"v1"), QoS::AtMostOnce);
        store.put("t", Bytes::from_static(b"v2"), QoS::AtLeastOnce);

        let msg = store.get("t").unwrap();
        assert_eq!(&msg.payload[..], b"v2");
        assert_eq!(msg.qos, QoS::AtLeastOnce);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clear_removes_entry() {
        let mut store = RetainedStore::new();
        store.put("t", Bytes::from_static(b"v"), QoS::AtMostOnce);
        store.clear("t");
        assert!(store.get("t").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_missing_topic() {
        let store = RetainedStore::new();
        assert!(store.get("nope").is_none());
    }
}
