//! Per-node MQTT client: owns one `rumqttc` session for a single WIS2
//! publisher node, runs its own reconnect/backoff loop, and feeds incoming
//! messages through resolution and batching.

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::batch::BatchBuffer;
use crate::db::{Db, NodeRow};
use crate::errors::CoreError;
use crate::message;
use crate::status_bus::{StatusBus, StatusSnapshot};

/// Rolling window width for the messages-per-minute rate counter.
const RATE_WINDOW: Duration = Duration::from_secs(60);
/// Hard cap on entries retained in the rate ring, regardless of rate.
const RATE_RING_CAP: usize = 1000;

/// Initial reconnect delay; doubles on each consecutive failure up to max.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(120);

/// MQTT keepalive, per the connect contract.
const KEEPALIVE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Stopping,
    Error,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Stopping => "stopping",
            ClientState::Error => "error",
        }
    }
}

impl Default for ClientState {
    fn default() -> Self {
        ClientState::Disconnected
    }
}

/// Renders a CONNACK return code the way status/log text reports it.
///
/// These numeric reasons (1-5) match MQTT 3.1.1's CONNACK return codes
/// exactly, which is what the reason-code table in the connect contract
/// actually enumerates; `rumqttc`'s default (non-v5) client surfaces these
/// directly as `ConnectReturnCode`.
fn reason_code_text(code: ConnectReturnCode) -> String {
    match code {
        ConnectReturnCode::Success => "success".to_string(),
        ConnectReturnCode::RefusedProtocolVersion => "incorrect protocol version".to_string(),
        ConnectReturnCode::BadClientId => "invalid client id".to_string(),
        ConnectReturnCode::ServiceUnavailable => "server unavailable".to_string(),
        ConnectReturnCode::BadUserNamePassword => "bad credentials".to_string(),
        ConnectReturnCode::NotAuthorized => "not authorized".to_string(),
        other => format!("code {}", other as u8),
    }
}

/// Accepts any server certificate. Used only when a node's catalogue entry
/// has `verify_ssl = false` — some WIS2 nodes run with self-signed broker
/// certs.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

fn webpki_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Builds the TLS transport for a node, honoring its `verify_ssl` flag.
fn tls_transport(verify_ssl: bool) -> Transport {
    let config = if verify_ssl {
        ClientConfig::builder()
            .with_root_certificates(webpki_root_store())
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    };
    Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Builds a client id unique per connection attempt, so a reconnecting
/// client never collides with its own previous session on the broker side
/// (which would otherwise trigger a takeover loop).
fn client_id(node_id: &str) -> String {
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("wis2watch_{node_id}_{epoch_ms}")
}

struct RateRing {
    events: VecDeque<Instant>,
}

impl RateRing {
    fn new() -> Self {
        Self { events: VecDeque::new() }
    }

    fn record(&mut self) {
        let now = Instant::now();
        self.events.push_back(now);
        while self.events.len() > RATE_RING_CAP {
            self.events.pop_front();
        }
        self.trim(now);
    }

    fn trim(&mut self, now: Instant) {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&mut self) -> u32 {
        self.trim(Instant::now());
        self.events.len() as u32
    }
}

/// Tracks the facts `is_healthy` needs plus the counters and transition
/// bookkeeping the status snapshot reports: messages seen, connect
/// attempts/outcomes, decode errors, and the previous/current state pair.
struct HealthTracker {
    messages_total: u64,
    last_message_at: Option<Instant>,
    connecting_since: Option<Instant>,
    connect_attempts: u64,
    connect_success: u64,
    connect_fail: u64,
    errors: u64,
    previous_state: ClientState,
    state_entered_at: OffsetDateTime,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self {
            messages_total: 0,
            last_message_at: None,
            connecting_since: None,
            connect_attempts: 0,
            connect_success: 0,
            connect_fail: 0,
            errors: 0,
            previous_state: ClientState::Disconnected,
            state_entered_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Moves the client to `new_state`, recording the outgoing state and the
/// moment of transition before announcing it on `state_tx`. Every state
/// change in the task loop must go through here so `previous_state` and
/// `state_entered_at` stay accurate for the status snapshot.
fn transition(
    state_tx: &watch::Sender<ClientState>,
    health: &StdMutex<HealthTracker>,
    new_state: ClientState,
) {
    {
        let mut h = health.lock().unwrap();
        h.previous_state = *state_tx.borrow();
        h.state_entered_at = OffsetDateTime::now_utc();
    }
    let _ = state_tx.send(new_state);
}

/// Builds a status snapshot from the current health counters and publishes
/// it. Failures are logged by `publish_status` internally via its own
/// `CoreResult` plumbing; callers here treat delivery as best-effort, per
/// the Status Bus's "fan-out failures don't affect ingestion" contract.
async fn emit_status(
    status_bus: &StatusBus,
    node_id: &str,
    state: ClientState,
    health: &StdMutex<HealthTracker>,
    rate: &mut RateRing,
    last_error: Option<&str>,
    force: bool,
) {
    let (previous_state, state_entered_at, messages_total, connect_attempts, connect_success, connect_fail, errors) = {
        let h = health.lock().unwrap();
        (
            h.previous_state,
            h.state_entered_at,
            h.messages_total,
            h.connect_attempts,
            h.connect_success,
            h.connect_fail,
            h.errors,
        )
    };
    let state_entered_at = state_entered_at
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    let snapshot = StatusSnapshot {
        node_id,
        state: state.as_str(),
        previous_state: previous_state.as_str(),
        state_entered_at: &state_entered_at,
        messages_last_60s: rate.count(),
        messages_total,
        connect_attempts,
        connect_success,
        connect_fail,
        errors,
        last_error,
    };
    let _ = status_bus.publish_status(&snapshot, force).await;
}

/// Handle a supervisor holds for a running node client task.
pub struct NodeHandle {
    pub node_id: String,
    pub state_rx: watch::Receiver<ClientState>,
    join: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    health: Arc<StdMutex<HealthTracker>>,
    health_silence: Duration,
    health_connecting: Duration,
}

impl NodeHandle {
    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    /// Connected with either no traffic yet or a message within the silence
    /// window, or still within the grace period for a fresh reconnect.
    pub fn is_healthy(&self) -> bool {
        let health = self.health.lock().unwrap();
        match self.state() {
            ClientState::Connected => {
                health.messages_total == 0
                    || health
                        .last_message_at
                        .map(|t| t.elapsed() <= self.health_silence)
                        .unwrap_or(false)
            }
            ClientState::Connecting => health
                .connecting_since
                .map(|t| t.elapsed() <= self.health_connecting)
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
    }
}

/// Spawn the background task for one node and return a handle to it.
pub fn spawn(
    node: NodeRow,
    db: Db,
    status_bus: Arc<StatusBus>,
    batch_size: usize,
    batch_age: Duration,
    health_silence: Duration,
    health_connecting: Duration,
    status_interval: Duration,
) -> NodeHandle {
    let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let node_id = node.node_id.clone();
    let handle_node_id = node_id.clone();
    let health = Arc::new(StdMutex::new(HealthTracker::default()));
    let task_health = Arc::clone(&health);

    let join = tokio::spawn(async move {
        let mut backoff = BACKOFF_INITIAL;
        let mut rate = RateRing::new();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            transition(&state_tx, &task_health, ClientState::Connecting);
            let _ = db.set_node_status(&node.node_id, "connecting", None).await;
            {
                let mut h = task_health.lock().unwrap();
                h.connecting_since = Some(Instant::now());
                h.connect_attempts += 1;
            }
            emit_status(&status_bus, &node.node_id, ClientState::Connecting, &task_health, &mut rate, None, true).await;

            let mut mqttoptions = MqttOptions::new(
                client_id(&node.node_id),
                &node.mqtt_host,
                node.mqtt_port as u16,
            );
            mqttoptions.set_keep_alive(KEEPALIVE);
            mqttoptions.set_clean_session(false);
            if node.mqtt_tls {
                mqttoptions.set_transport(tls_transport(node.verify_ssl));
            }
            if let (Some(user), Some(pass)) = (&node.mqtt_username, &node.mqtt_password) {
                mqttoptions.set_credentials(user.clone(), pass.clone());
            }

            let (client, mut eventloop) = AsyncClient::new(mqttoptions, 50);

            let topics = match db.active_topics_for_node(&node.node_id).await {
                Ok(t) => t,
                Err(e) => {
                    error!(node = %node.node_id, "failed to load topics: {e}");
                    Vec::new()
                }
            };
            for topic in &topics {
                if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                    warn!(node = %node.node_id, topic = %topic, "subscribe failed: {e}");
                }
            }

            let mut batch = BatchBuffer::new(batch_size, batch_age);
            let mut flush_ticker = tokio::time::interval(Duration::from_millis(200));
            let mut status_ticker = tokio::time::interval(status_interval);
            status_ticker.tick().await; // first tick fires immediately; skip it
            let mut connected_ok = false;

            'session: loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            transition(&state_tx, &task_health, ClientState::Stopping);
                            break 'session;
                        }
                    }

                    _ = flush_ticker.tick() => {
                        if batch.should_flush() {
                            let current_state = *state_tx.borrow();
                            flush_batch(&db, &status_bus, &node.node_id, &task_health, &mut batch, &mut rate, current_state).await;
                        }
                    }

                    _ = status_ticker.tick() => {
                        let current_state = *state_tx.borrow();
                        emit_status(&status_bus, &node.node_id, current_state, &task_health, &mut rate, None, false).await;
                    }

                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                                connected_ok = true;
                                backoff = BACKOFF_INITIAL;
                                {
                                    let mut h = task_health.lock().unwrap();
                                    h.connecting_since = None;
                                    h.connect_success += 1;
                                }
                                transition(&state_tx, &task_health, ClientState::Connected);
                                let _ = db.set_node_status(&node.node_id, "connected", None).await;
                                emit_status(&status_bus, &node.node_id, ClientState::Connected, &task_health, &mut rate, None, true).await;
                                info!(node = %node.node_id, "mqtt session connected");
                            }
                            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                                let reason = reason_code_text(ack.code);
                                warn!(node = %node.node_id, reason = %reason, "broker refused connection");
                                task_health.lock().unwrap().connect_fail += 1;
                                transition(&state_tx, &task_health, ClientState::Error);
                                let _ = db.set_node_status(&node.node_id, "error", Some(&reason)).await;
                                emit_status(&status_bus, &node.node_id, ClientState::Error, &task_health, &mut rate, Some(&reason), true).await;
                                break 'session;
                            }
                            Ok(Event::Incoming(Packet::Publish(p))) => {
                                rate.record();
                                {
                                    let mut health = task_health.lock().unwrap();
                                    health.messages_total += 1;
                                    health.last_message_at = Some(Instant::now());
                                }
                                let topic = p.topic.clone();
                                let received_at = OffsetDateTime::now_utc();
                                match message::resolve(&db, &node, &p.payload, received_at).await {
                                    Ok(resolved) => batch.push(resolved),
                                    Err(e) => {
                                        if matches!(e, CoreError::DecodeFailed(_)) {
                                            task_health.lock().unwrap().errors += 1;
                                        }
                                        warn!(node = %node.node_id, topic = %topic, "message resolution failed: {e}");
                                    }
                                }
                                let _ = status_bus
                                    .publish_message_received(
                                        &node.node_id,
                                        &topic,
                                        &received_at
                                            .format(&time::format_description::well_known::Rfc3339)
                                            .unwrap_or_default(),
                                        None,
                                    )
                                    .await;
                            }
                            Ok(Event::Incoming(Packet::Disconnect)) => {
                                warn!(node = %node.node_id, "broker sent disconnect");
                                task_health.lock().unwrap().connect_fail += 1;
                                transition(&state_tx, &task_health, ClientState::Error);
                                let _ = db.set_node_status(&node.node_id, "error", Some("broker sent disconnect")).await;
                                emit_status(&status_bus, &node.node_id, ClientState::Error, &task_health, &mut rate, Some("broker sent disconnect"), true).await;
                                break 'session;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(node = %node.node_id, "mqtt event loop error: {e}");
                                task_health.lock().unwrap().connect_fail += 1;
                                transition(&state_tx, &task_health, ClientState::Error);
                                let _ = db.set_node_status(&node.node_id, "error", Some(&e.to_string())).await;
                                emit_status(&status_bus, &node.node_id, ClientState::Error, &task_health, &mut rate, Some(&e.to_string()), true).await;
                                break 'session;
                            }
                        }
                    }
                }
            }

            if !batch.is_empty() {
                let current_state = *state_tx.borrow();
                flush_batch(&db, &status_bus, &node.node_id, &task_health, &mut batch, &mut rate, current_state).await;
            }

            if *stop_rx.borrow() {
                let _ = db.set_node_status(&node.node_id, "disconnected", None).await;
                transition(&state_tx, &task_health, ClientState::Disconnected);
                rate = RateRing::new();
                emit_status(&status_bus, &node.node_id, ClientState::Disconnected, &task_health, &mut rate, None, true).await;
                break;
            }

            // The session ended on error or broker disconnect: the state is
            // already Error (set by the arm that broke out of 'session), and
            // the status bus already reflects that. spec.md's state diagram
            // has no Disconnected hop on this edge — only
            // `Error --connect()--> Connecting` — so the backoff sleep below
            // leaves the state as Error until the next connect attempt's own
            // transition to Connecting.
            if !connected_ok {
                warn!(node = %node.node_id, backoff_secs = backoff.as_secs(), "reconnecting after failure");
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }

        info!(node = %node_id, "node client task exited");
    });

    NodeHandle {
        node_id: handle_node_id,
        state_rx,
        join,
        stop_tx,
        health,
        health_silence,
        health_connecting,
    }
}

async fn flush_batch(
    db: &Db,
    status_bus: &StatusBus,
    node_id: &str,
    health: &StdMutex<HealthTracker>,
    batch: &mut BatchBuffer,
    rate: &mut RateRing,
    state: ClientState,
) {
    let items = batch.take();
    let n = items.len();
    let mut stored = 0usize;
    for obs in &items {
        match message::store(db, obs).await {
            Ok(true) => stored += 1,
            Ok(false) => {}
            Err(e) => error!(node = %node_id, "observation insert failed: {e}"),
        }
    }
    if n > 0 {
        info!(node = %node_id, batch_size = n, inserted = stored, "batch flushed");
    }
    emit_status(status_bus, node_id, state, health, rate, None, false).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_state_as_str_matches_db_status_vocabulary() {
        assert_eq!(ClientState::Disconnected.as_str(), "disconnected");
        assert_eq!(ClientState::Connecting.as_str(), "connecting");
        assert_eq!(ClientState::Connected.as_str(), "connected");
        assert_eq!(ClientState::Stopping.as_str(), "stopping");
        assert_eq!(ClientState::Error.as_str(), "error");
    }

    #[test]
    fn rate_ring_counts_recent_events() {
        let mut ring = RateRing::new();
        for _ in 0..5 {
            ring.record();
        }
        assert_eq!(ring.count(), 5);
    }

    #[test]
    fn rate_ring_caps_entries() {
        let mut ring = RateRing::new();
        for _ in 0..(RATE_RING_CAP + 50) {
            ring.record();
        }
        assert!(ring.events.len() <= RATE_RING_CAP);
    }

    #[test]
    fn client_id_is_unique_across_calls() {
        let a = client_id("node-a");
        std::thread::sleep(Duration::from_millis(2));
        let b = client_id("node-a");
        assert_ne!(a, b);
        assert!(a.starts_with("wis2watch_node-a_"));
    }

    #[test]
    fn transition_records_previous_state_and_advances_state_entered_at() {
        let (state_tx, _state_rx) = watch::channel(ClientState::Disconnected);
        let health = StdMutex::new(HealthTracker::default());

        let first_entered_at = health.lock().unwrap().state_entered_at;
        std::thread::sleep(Duration::from_millis(2));
        transition(&state_tx, &health, ClientState::Connecting);

        let h = health.lock().unwrap();
        assert_eq!(h.previous_state, ClientState::Disconnected);
        assert_eq!(*state_tx.borrow(), ClientState::Connecting);
        assert!(h.state_entered_at > first_entered_at);
    }

    #[test]
    fn transition_chain_keeps_state_entered_at_non_decreasing() {
        let (state_tx, _state_rx) = watch::channel(ClientState::Disconnected);
        let health = StdMutex::new(HealthTracker::default());

        let mut last = health.lock().unwrap().state_entered_at;
        for state in [ClientState::Connecting, ClientState::Connected, ClientState::Error] {
            std::thread::sleep(Duration::from_millis(1));
            transition(&state_tx, &health, state);
            let current = health.lock().unwrap().state_entered_at;
            assert!(current >= last);
            last = current;
        }
    }
}
