//! MQTT broker server.
//!
//! A single-threaded readiness loop over the listener and every client
//! socket. The loop thread exclusively owns all connections, the
//! subscription index and the retained store, so handlers run without locks.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::client::{Client, ClientState};
use crate::config::Config;
use crate::error::{ProtocolError, Result};
use crate::metrics::BrokerMetrics;
use crate::packet::{
    Connack, Connect, Packet, Puback, Publish, QoS, Suback, Subscribe, Unsuback, Unsubscribe,
};
use crate::retained::RetainedStore;
use crate::subscription::SubscriptionIndex;

/// Token for the listener socket.
const LISTENER: Token = Token(0);

/// First token handed to client connections.
const CLIENT_START: usize = 1;

/// Readiness wait timeout; bounds shutdown and keep-alive latency.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// MQTT broker server.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    clients: AHashMap<Token, Client>,
    next_token: usize,
    subscriptions: SubscriptionIndex,
    retained: RetainedStore,
    metrics: Arc<BrokerMetrics>,
    config: Arc<Config>,
    running: Arc<AtomicBool>,
}

impl Server {
    /// Create a new server bound to the configured address.
    pub fn new(
        config: Arc<Config>,
        metrics: Arc<BrokerMetrics>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.server.bind)?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        info!("tinymq listening on {}", listener.local_addr()?);

        Ok(Self {
            poll,
            listener,
            clients: AHashMap::new(),
            next_token: CLIENT_START,
            subscriptions: SubscriptionIndex::new(),
            retained: RetainedStore::new(),
            metrics,
            config,
            running,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the event loop until the running flag is cleared.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            // The listener is serviced before client data within one tick.
            for event in events.iter() {
                if event.token() == LISTENER {
                    self.accept_connections();
                }
            }

            for event in events.iter() {
                let token = event.token();
                if token == LISTENER {
                    continue;
                }
                if event.is_readable() {
                    self.handle_readable(token);
                }
                if event.is_writable() {
                    self.handle_writable(token);
                }
            }

            self.check_keep_alives();
            self.cleanup_clients();
        }

        self.shutdown();
        Ok(())
    }

    /// Accept new connections until the listener would block.
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut socket, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut socket, token, Interest::READABLE)
                    {
                        error!("failed to register socket from {}: {}", addr, e);
                        continue;
                    }

                    debug!("accepted connection from {} as {:?}", addr, token);
                    self.clients.insert(token, Client::new(token, socket, addr));

                    self.metrics.inc_total_connections();
                    self.metrics.set_active_connections(self.clients.len() as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let bytes_read = {
            let Some(client) = self.clients.get_mut(&token) else {
                return;
            };
            match client.read() {
                Ok(n) => n,
                Err(e) => {
                    debug!("client {:?}: read error: {}", token, e);
                    return;
                }
            }
        };
        if bytes_read > 0 {
            self.metrics.inc_bytes_received(bytes_read as u64);
        }

        loop {
            let packet = {
                let Some(client) = self.clients.get_mut(&token) else {
                    return;
                };
                if client.state == ClientState::Disconnecting {
                    return;
                }
                match client.next_packet(self.config.limits.max_packet_size) {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("client {:?}: protocol error: {}", token, e);
                        self.metrics.inc_connection_errors();
                        // A CONNECT that fails to parse still gets an error
                        // CONNACK before the connection drops.
                        if client.state == ClientState::Connecting {
                            let connack = Packet::Connack(Connack {
                                session_present: false,
                                reason_code: 0x80, // Unspecified error
                            });
                            if let Ok(n) = client.queue_packet(&connack) {
                                self.metrics.inc_bytes_sent(n as u64);
                                let _ = client.flush();
                            }
                        }
                        client.state = ClientState::Disconnecting;
                        return;
                    }
                }
            };
            if let Err(e) = self.handle_packet(token, packet) {
                // State-gate violations close the connection without reply.
                warn!("client {:?}: {}, closing", token, e);
                if let Some(client) = self.clients.get_mut(&token) {
                    client.state = ClientState::Disconnecting;
                }
                return;
            }
        }

        // Peer sent FIN; everything decodable has been handled above.
        if let Some(client) = self.clients.get_mut(&token) {
            if client.peer_closed() {
                client.state = ClientState::Disconnecting;
            }
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        match client.flush() {
            Ok(true) => {
                // Drained; stop watching for writability.
                if let Err(e) =
                    self.poll
                        .registry()
                        .reregister(&mut client.socket, token, Interest::READABLE)
                {
                    debug!("client {:?}: reregister failed: {}", token, e);
                    client.state = ClientState::Disconnecting;
                }
            }
            Ok(false) => {}
            Err(e) => debug!("client {:?}: flush error: {}", token, e),
        }
    }

    fn handle_packet(&mut self, token: Token, packet: Packet) -> Result<()> {
        let state = match self.clients.get(&token) {
            Some(client) => client.state,
            None => return Ok(()),
        };

        match packet {
            Packet::Connect(connect) => self.handle_connect(token, connect),

            // MQTT-3.1.0-1: the first packet from a client must be CONNECT.
            _ if state == ClientState::Connecting => {
                return Err(ProtocolError::FirstPacketNotConnect.into());
            }

            Packet::Publish(publish) => self.handle_publish(token, publish),

            Packet::Puback(puback) => {
                if let Some(client) = self.clients.get_mut(&token) {
                    if client.pending_qos1.remove(&puback.packet_id).is_none() {
                        debug!(
                            "client {:?}: PUBACK for unknown packet id {}",
                            token, puback.packet_id
                        );
                    }
                }
            }

            Packet::Subscribe(subscribe) => self.handle_subscribe(token, subscribe),

            Packet::Unsubscribe(unsub) => self.handle_unsubscribe(token, unsub),

            Packet::Pingreq => self.send_packet(token, &Packet::Pingresp),

            Packet::Disconnect { reason_code } => self.handle_disconnect(token, reason_code),

            other => debug!("client {:?}: ignoring {:?}", token, other),
        }

        Ok(())
    }

    fn handle_connect(&mut self, token: Token, connect: Connect) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        // MQTT-3.1.0-2: a second CONNECT is a protocol error.
        if client.state != ClientState::Connecting {
            warn!("client {:?}: duplicate CONNECT, closing", token);
            client.state = ClientState::Disconnecting;
            return;
        }

        info!(
            "client {:?} ({}) connected: id={:?} {} v{} keep_alive={}s",
            token,
            client.addr,
            connect.client_id,
            connect.protocol_name,
            connect.protocol_version,
            connect.keep_alive
        );

        client.client_id = Some(connect.client_id);
        client.keep_alive = connect.keep_alive;
        client.state = ClientState::Connected;

        self.send_packet(
            token,
            &Packet::Connack(Connack {
                session_present: false,
                reason_code: 0,
            }),
        );
    }

    fn handle_publish(&mut self, token: Token, publish: Publish) {
        self.metrics.inc_messages_received();
        self.metrics.observe_message_size(publish.payload.len() as u64);

        if publish.retain {
            // MQTT-3.3.1-6: a zero-byte retained payload clears the entry.
            if publish.payload.is_empty() {
                self.retained.clear(&publish.topic);
            } else {
                self.retained
                    .put(&publish.topic, publish.payload.clone(), publish.qos);
            }
        }

        // Snapshot so fan-out can borrow clients mutably.
        let subs = self.subscriptions.subscribers_for(&publish.topic).to_vec();
        for sub in subs {
            let Some(subscriber) = self.clients.get_mut(&sub.token) else {
                continue;
            };
            if subscriber.state != ClientState::Connected {
                continue;
            }

            // QoS 2 is not supported outbound; cap at the subscription grant.
            let qos = publish.qos.min(sub.qos).min(QoS::AtLeastOnce);
            let packet_id = if qos == QoS::AtLeastOnce {
                let id = subscriber.allocate_packet_id();
                subscriber.pending_qos1.insert(id, Instant::now());
                Some(id)
            } else {
                None
            };

            let out = Packet::Publish(Publish {
                dup: false,
                qos,
                retain: false,
                topic: publish.topic.clone(),
                packet_id,
                payload: publish.payload.clone(),
            });
            self.send_packet(sub.token, &out);
            self.metrics.inc_messages_published();
        }

        match publish.qos {
            QoS::AtLeastOnce => {
                if let Some(packet_id) = publish.packet_id {
                    self.send_packet(
                        token,
                        &Packet::Puback(Puback {
                            packet_id,
                            reason_code: 0,
                        }),
                    );
                }
            }
            // Parsed for tolerance; no PUBREC flow exists at this QoS cap.
            QoS::ExactlyOnce => {
                debug!("client {:?}: QoS 2 publish not acknowledged", token)
            }
            QoS::AtMostOnce => {}
        }
    }

    fn handle_subscribe(&mut self, token: Token, subscribe: Subscribe) {
        let mut reason_codes = Vec::with_capacity(subscribe.topics.len());

        for (filter, requested_qos) in &subscribe.topics {
            self.subscriptions.add(filter, token, *requested_qos);
            reason_codes.push(*requested_qos as u8);

            // Replay the retained message, if any, ahead of the SUBACK.
            let replay = self
                .retained
                .get(filter)
                .map(|r| (r.payload.clone(), r.qos));
            if let Some((payload, stored_qos)) = replay {
                let qos = stored_qos.min(*requested_qos).min(QoS::AtLeastOnce);
                let packet_id = match self.clients.get_mut(&token) {
                    Some(client) if qos == QoS::AtLeastOnce => {
                        let id = client.allocate_packet_id();
                        client.pending_qos1.insert(id, Instant::now());
                        Some(id)
                    }
                    _ => None,
                };
                let out = Packet::Publish(Publish {
                    dup: false,
                    qos,
                    retain: true,
                    topic: filter.clone(),
                    packet_id,
                    payload,
                });
                self.send_packet(token, &out);
                self.metrics.inc_messages_published();
            }
        }

        self.send_packet(
            token,
            &Packet::Suback(Suback {
                packet_id: subscribe.packet_id,
                reason_codes,
            }),
        );

        self.metrics
            .set_active_subscriptions(self.subscriptions.total() as u64);
    }

    fn handle_unsubscribe(&mut self, token: Token, unsub: Unsubscribe) {
        let mut reason_codes = Vec::with_capacity(unsub.topics.len());

        for filter in &unsub.topics {
            let existed = self.subscriptions.remove(filter, token);
            // MQTT-3.11.3: 0x11 = no subscription existed.
            reason_codes.push(if existed { 0x00 } else { 0x11 });
        }

        self.send_packet(
            token,
            &Packet::Unsuback(Unsuback {
                packet_id: unsub.packet_id,
                reason_codes,
            }),
        );

        self.metrics
            .set_active_subscriptions(self.subscriptions.total() as u64);
    }

    fn handle_disconnect(&mut self, token: Token, reason_code: u8) {
        debug!(
            "client {:?} sent DISCONNECT (reason {:#04x})",
            token, reason_code
        );
        self.subscriptions.remove_all(token);
        if let Some(client) = self.clients.get_mut(&token) {
            client.state = ClientState::Disconnecting;
        }
    }

    /// Queue a packet on a client and flush opportunistically. A full socket
    /// arms writable interest so the remainder drains on a later tick.
    fn send_packet(&mut self, token: Token, packet: &Packet) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        let n = match client.queue_packet(packet) {
            Ok(n) => n,
            Err(e) => {
                // Encoding from in-memory values cannot fail unless a handler
                // built an impossible packet.
                error!("client {:?}: failed to encode response: {}", token, e);
                return;
            }
        };
        self.metrics.inc_bytes_sent(n as u64);

        match client.flush() {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.poll.registry().reregister(
                    &mut client.socket,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    debug!("client {:?}: reregister failed: {}", token, e);
                    client.state = ClientState::Disconnecting;
                }
            }
            Err(e) => debug!("client {:?}: send failed: {}", token, e),
        }
    }

    /// Close connections that have been silent past 1.5x their keep-alive.
    fn check_keep_alives(&mut self) {
        let now = Instant::now();
        for (token, client) in &mut self.clients {
            if client.state == ClientState::Connected && client.keep_alive > 0 {
                let timeout = Duration::from_secs((client.keep_alive as u64 * 3) / 2);
                if now.duration_since(client.last_packet_time) > timeout {
                    warn!(
                        "client {:?}: keep-alive timeout after {}s of silence",
                        token,
                        timeout.as_secs()
                    );
                    client.state = ClientState::Disconnecting;
                }
            }
        }
    }

    /// Drop disconnecting clients and purge them from the index before the
    /// next loop iteration.
    fn cleanup_clients(&mut self) {
        let dead: Vec<Token> = self
            .clients
            .iter()
            .filter(|(_, c)| c.state == ClientState::Disconnecting)
            .map(|(t, _)| *t)
            .collect();
        if dead.is_empty() {
            return;
        }

        for token in dead {
            if let Some(mut client) = self.clients.remove(&token) {
                self.subscriptions.remove_all(token);
                if let Err(e) = self.poll.registry().deregister(&mut client.socket) {
                    debug!("client {:?}: deregister failed: {}", token, e);
                }
                if client.has_received_data() {
                    info!("client {:?} ({}) disconnected", token, client.addr);
                } else {
                    debug!("client {:?} ({}) closed without sending data", token, client.addr);
                }
            }
        }

        self.metrics.set_active_connections(self.clients.len() as u64);
        self.metrics
            .set_active_subscriptions(self.subscriptions.total() as u64);
    }

    /// Close every client on the way out.
    fn shutdown(&mut self) {
        info!("shutting down, closing {} connection(s)", self.clients.len());
        for (_token, mut client) in self.clients.drain() {
            let _ = self.poll.registry().deregister(&mut client.socket);
        }
        self.metrics.set_active_connections(0);
        self.metrics.set_active_subscriptions(0);
    }
}
