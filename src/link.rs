//! One serial channel: connection, reader thread and reconnection.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected        (user disconnect)
//!                                         -> Reconnecting(n)     (link lost)
//! Reconnecting(n) -> Connected                                   (reopen succeeded)
//!                 -> Exhausted                                   (attempt limit hit)
//! ```
//!
//! The reader thread is the only code that touches the transport. Commands are
//! handed to it over a bounded channel and written between reads, so reads and
//! writes never race on the handle.
//!
//! Reconnection runs inside the same thread: one timer per channel at a time,
//! and a stop request is honoured between timer slices.
//!
//! Every connect and disconnect starts a new session. A reader only writes
//! channel state while its session is current and stops on its own cancel
//! flag, so a reader detached after a join timeout cannot disturb the next
//! connection.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::LinkConfig;
use crate::decoder::{ChecksumStatus, FrameDecoder, FrameOutcome};
use crate::encoder::{CommandEncoder, CommandFrame};
use crate::errors::{LinkError, Result};
use crate::health::{ChecksumMonitor, ChecksumStats};
use crate::lock_unpoisoned as lock;
use crate::protocol::{ChannelId, ProtocolVersion};
use crate::queue::EventQueue;
use crate::transport::{Connector, Transport};

/// Pause when a read returns no bytes.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Granularity at which reconnect waits check for a stop request.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Pending command writes the reader accepts before callers see back-pressure.
const TRANSMIT_QUEUE_DEPTH: usize = 32;

/// Connection phase of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Terminal disconnected state after the reconnect budget ran out.
    /// Only an explicit `connect` leaves it.
    Exhausted,
}

impl ConnectionState {
    /// Whether a reader thread currently owns (or is reacquiring) the port.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Snapshot of a channel for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelState {
    pub id: ChannelId,
    pub connection: ConnectionState,
    pub checksum_enabled: bool,
    pub reconnect_attempts: u32,
    /// Bytes dropped by receive-buffer overflow over the channel's lifetime.
    pub discarded_bytes: u64,
    pub port: Option<String>,
    pub baud: u32,
    pub protocol: ProtocolVersion,
}

struct TransmitRequest {
    data: Vec<u8>,
    result_tx: mpsc::SyncSender<Result<()>>,
}

/// State shared between the link handle and its reader thread.
struct Shared {
    id: ChannelId,
    state: Mutex<ChannelState>,
    health: Mutex<ChecksumMonitor>,
    /// Current session number. Only changed while `state` is locked.
    session: AtomicU64,
    checksum_enabled: AtomicBool,
}

impl Shared {
    fn update<F: FnOnce(&mut ChannelState)>(&self, f: F) {
        f(&mut *lock(&self.state));
    }

    fn set_connection(&self, connection: ConnectionState) {
        self.update(|s| s.connection = connection);
    }

    /// Retire the current session and apply `f` atomically with the switch.
    fn next_session<F: FnOnce(&mut ChannelState)>(&self, f: F) -> u64 {
        let mut state = lock(&self.state);
        f(&mut state);
        self.session.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Apply `f` only if `session` is still current.
    fn update_session<F: FnOnce(&mut ChannelState)>(&self, session: u64, f: F) -> bool {
        let mut state = lock(&self.state);
        if self.session.load(Ordering::Acquire) != session {
            return false;
        }
        f(&mut state);
        true
    }
}

struct Worker {
    handle: JoinHandle<()>,
    done_rx: mpsc::Receiver<()>,
    transmit_tx: mpsc::SyncSender<TransmitRequest>,
    running: Arc<AtomicBool>,
}

/// Owns one serial connection and everything that reads from it.
pub struct ChannelLink {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    queue: Arc<EventQueue>,
    encoder: CommandEncoder,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl ChannelLink {
    pub fn new(
        id: ChannelId,
        config: LinkConfig,
        connector: Arc<dyn Connector>,
        queue: Arc<EventQueue>,
    ) -> Result<Self> {
        config.validate()?;
        let state = ChannelState {
            id,
            connection: ConnectionState::Disconnected,
            checksum_enabled: config.checksum_enabled,
            reconnect_attempts: 0,
            discarded_bytes: 0,
            port: None,
            baud: 0,
            protocol: config.protocol,
        };
        let shared = Arc::new(Shared {
            id,
            state: Mutex::new(state),
            health: Mutex::new(ChecksumMonitor::new(id, config.health.clone())),
            session: AtomicU64::new(0),
            checksum_enabled: AtomicBool::new(config.checksum_enabled),
        });
        Ok(Self {
            encoder: CommandEncoder::new(config.protocol),
            config,
            connector,
            queue,
            shared,
            worker: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn snapshot(&self) -> ChannelState {
        lock(&self.shared.state).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot().connection == ConnectionState::Connected
    }

    pub fn checksum_stats(&self) -> ChecksumStats {
        lock(&self.shared.health).snapshot()
    }

    pub fn reset_checksum_stats(&self) {
        lock(&self.shared.health).reset();
    }

    /// Toggle checksum validation; takes effect on the next received bytes.
    pub fn set_checksum_enabled(&self, enabled: bool) {
        self.shared.checksum_enabled.store(enabled, Ordering::Release);
        self.shared.update(|s| s.checksum_enabled = enabled);
        info!(
            "channel {}: checksum validation {}",
            self.id(),
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Open `port` and start the reader thread.
    ///
    /// An open failure is returned to the caller and leaves the channel
    /// disconnected; reconnection only covers links that were up.
    pub fn connect(&self, port: &str, baud: u32) -> Result<()> {
        let mut worker = lock(&self.worker);
        if self.snapshot().connection.is_active() {
            return Err(LinkError::AlreadyConnected(self.id()));
        }
        if let Some(finished) = worker.take() {
            // Left over from an exhausted session.
            self.join_worker(finished);
        }

        let session = self.shared.next_session(|s| {
            s.connection = ConnectionState::Connecting;
            s.port = Some(port.to_string());
            s.baud = baud;
            s.reconnect_attempts = 0;
        });
        info!("channel {}: connecting to {} at {} baud", self.id(), port, baud);

        let transport = match self.connector.open(port, baud) {
            Ok(t) => t,
            Err(e) => {
                self.shared.set_connection(ConnectionState::Disconnected);
                warn!("channel {}: connect failed: {}", self.id(), e);
                return Err(e);
            }
        };

        let (transmit_tx, transmit_rx) = mpsc::sync_channel(TRANSMIT_QUEUE_DEPTH);
        let (done_tx, done_rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        self.shared.set_connection(ConnectionState::Connected);

        let reader = Reader {
            shared: self.shared.clone(),
            session,
            running: running.clone(),
            config: self.config.clone(),
            connector: self.connector.clone(),
            queue: self.queue.clone(),
            port: port.to_string(),
            baud,
            transmit_rx,
        };
        let spawned = thread::Builder::new()
            .name(format!("sm1-link-{}", self.id()))
            .spawn(move || {
                reader.run(transport);
                let _ = done_tx.send(());
            });
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                self.shared.set_connection(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        *worker = Some(Worker {
            handle,
            done_rx,
            transmit_tx,
            running,
        });
        info!("channel {}: connected to {}", self.id(), port);
        Ok(())
    }

    /// Stop the reader and release the port. Safe to call when already disconnected.
    ///
    /// The channel is always left disconnected. If the reader does not stop
    /// within the join timeout it is detached and `Timeout` is returned.
    pub fn disconnect(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        self.shared.next_session(|s| {
            s.connection = ConnectionState::Disconnected;
            s.reconnect_attempts = 0;
        });
        let joined = worker.take().map_or(true, |w| self.join_worker(w));
        info!("channel {}: disconnected", self.id());
        if joined {
            Ok(())
        } else {
            Err(LinkError::Timeout(format!(
                "channel {}: reader did not stop within {:?}",
                self.id(),
                self.config.join_timeout()
            )))
        }
    }

    /// Cancel the reader and wait for it. Returns false if it was detached.
    fn join_worker(&self, worker: Worker) -> bool {
        let Worker {
            handle,
            done_rx,
            transmit_tx,
            running,
        } = worker;
        running.store(false, Ordering::Release);
        drop(transmit_tx);
        let timeout = self.config.join_timeout();
        match done_rx.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("channel {}: reader thread panicked", self.id());
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // The OS reclaims the handle at exit; teardown continues.
                warn!(
                    "channel {}: reader did not stop within {:?}, detaching",
                    self.id(),
                    timeout
                );
                false
            }
        }
    }

    /// Encode `frame` for this channel's protocol and write it.
    pub fn send(&self, frame: &CommandFrame) -> Result<()> {
        let bytes = self.encoder.encode(frame);
        self.transmit(bytes)?;
        info!(
            "channel {}: sent {:?} ({:?}) max={:.1}V min={:.1}V current={:.1}A",
            self.id(),
            frame.mode,
            frame.operation_mode,
            frame.max_voltage,
            frame.min_voltage,
            frame.current
        );
        Ok(())
    }

    fn transmit(&self, data: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected(self.id()));
        }
        let tx = lock(&self.worker)
            .as_ref()
            .map(|w| w.transmit_tx.clone())
            .ok_or(LinkError::NotConnected(self.id()))?;

        let (result_tx, result_rx) = mpsc::sync_channel(1);
        tx.try_send(TransmitRequest { data, result_tx })
            .map_err(|e| match e {
                mpsc::TrySendError::Full(_) => {
                    LinkError::Timeout(format!("channel {}: transmit queue full", self.id()))
                }
                mpsc::TrySendError::Disconnected(_) => LinkError::NotConnected(self.id()),
            })?;

        let timeout = self.config.transmit_timeout();
        result_rx.recv_timeout(timeout).map_err(|_| {
            LinkError::Timeout(format!(
                "channel {}: no write confirmation within {:?}",
                self.id(),
                timeout
            ))
        })?
    }
}

impl Drop for ChannelLink {
    fn drop(&mut self) {
        if lock(&self.worker).is_some() {
            let _ = self.disconnect();
        }
    }
}

// ============================================================================
// Reader thread
// ============================================================================

enum SessionEnd {
    Stopped,
    Lost,
}

struct Reader {
    shared: Arc<Shared>,
    session: u64,
    running: Arc<AtomicBool>,
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    queue: Arc<EventQueue>,
    port: String,
    baud: u32,
    transmit_rx: mpsc::Receiver<TransmitRequest>,
}

impl Reader {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Write channel state unless this reader's session has been retired.
    fn publish<F: FnOnce(&mut ChannelState)>(&self, f: F) -> bool {
        self.shared.update_session(self.session, f)
    }

    fn run(self, transport: Box<dyn Transport>) {
        let id = self.shared.id;
        let mut decoder = FrameDecoder::new(id, self.config.protocol)
            .with_max_buffer_len(self.config.max_buffer_len)
            .with_checksum(self.shared.checksum_enabled.load(Ordering::Acquire));

        let mut transport = transport;
        loop {
            match self.read_session(transport.as_mut(), &mut decoder) {
                SessionEnd::Stopped => break,
                SessionEnd::Lost => {
                    drop(transport);
                    decoder.clear();
                    match self.reconnect() {
                        Some(t) => transport = t,
                        None => return,
                    }
                }
            }
        }
        debug!("channel {}: reader stopped", id);
    }

    fn read_session(&self, transport: &mut dyn Transport, decoder: &mut FrameDecoder) -> SessionEnd {
        let id = self.shared.id;
        let mut buf = [0u8; 256];
        let mut read_errors = 0u32;

        while self.is_running() {
            while let Ok(req) = self.transmit_rx.try_recv() {
                let result = transport
                    .write_all(&req.data)
                    .and_then(|_| transport.flush())
                    .map_err(LinkError::from);
                if let Err(e) = &result {
                    warn!("channel {}: write failed: {}", id, e);
                }
                let _ = req.result_tx.try_send(result);
            }

            match transport.read(&mut buf) {
                Ok(0) => thread::sleep(IDLE_POLL),
                Ok(n) => {
                    read_errors = 0;
                    self.handle_bytes(decoder, &buf[..n]);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    read_errors = 0;
                }
                Err(e) => {
                    read_errors += 1;
                    warn!(
                        "channel {}: read error ({}/{}): {}",
                        id, read_errors, self.config.max_consecutive_read_errors, e
                    );
                    if read_errors >= self.config.max_consecutive_read_errors {
                        warn!("channel {}: link lost", id);
                        return SessionEnd::Lost;
                    }
                    thread::sleep(self.config.read_error_backoff());
                }
            }
        }
        SessionEnd::Stopped
    }

    fn handle_bytes(&self, decoder: &mut FrameDecoder, bytes: &[u8]) {
        decoder.set_checksum_enabled(self.shared.checksum_enabled.load(Ordering::Acquire));
        let outcomes = decoder.push(bytes);
        if outcomes.is_empty() {
            return;
        }

        // Notices are kept by the monitor and surface through its snapshot.
        let mut discarded = 0u64;
        let mut health = lock(&self.shared.health);
        for outcome in outcomes {
            match outcome {
                FrameOutcome::Decoded { sample, checksum } => {
                    if checksum == ChecksumStatus::Valid {
                        health.record_success();
                    }
                    self.queue.enqueue(sample);
                }
                FrameOutcome::ChecksumMismatch { .. } => {
                    health.record_failure();
                }
                FrameOutcome::Overflow { discarded: n } => discarded += n as u64,
            }
        }
        drop(health);
        if discarded > 0 {
            self.publish(|s| s.discarded_bytes += discarded);
        }
    }

    /// Reopen the port on a fixed interval until it works, the budget runs
    /// out, or a stop is requested.
    fn reconnect(&self) -> Option<Box<dyn Transport>> {
        let id = self.shared.id;
        let max = self.config.max_reconnect_attempts;
        let interval = self.config.reconnect_interval();
        let mut attempt = 0u32;

        loop {
            if attempt >= max {
                self.running.store(false, Ordering::Release);
                if self.publish(|s| s.connection = ConnectionState::Exhausted) {
                    warn!(
                        "channel {}: giving up on {} after {} reconnect attempts",
                        id, self.port, attempt
                    );
                }
                return None;
            }
            attempt += 1;
            let current = self.publish(|s| {
                s.connection = ConnectionState::Reconnecting { attempt };
                s.reconnect_attempts = attempt;
            });
            if !current {
                return None;
            }
            info!(
                "channel {}: reconnect attempt {}/{} in {:?}",
                id, attempt, max, interval
            );

            if !self.wait_while_running(interval) {
                return None;
            }

            match self.connector.open(&self.port, self.baud) {
                Ok(transport) => {
                    let current = self.is_running()
                        && self.publish(|s| {
                            s.connection = ConnectionState::Connected;
                            s.reconnect_attempts = 0;
                        });
                    if !current {
                        debug!("channel {}: reopened port belongs to a retired session", id);
                        return None;
                    }
                    info!("channel {}: reconnected to {}", id, self.port);
                    return Some(transport);
                }
                Err(e) => warn!("channel {}: reconnect attempt {} failed: {}", id, attempt, e),
            }
        }
    }

    /// Sleep for `duration` unless stopped first. Commands arriving meanwhile are refused.
    fn wait_while_running(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            while let Ok(req) = self.transmit_rx.try_recv() {
                let _ = req
                    .result_tx
                    .try_send(Err(LinkError::NotConnected(self.shared.id)));
            }
            if !self.is_running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::OperationMode;
    use crate::health::HealthNotice;
    use crate::transport::MemoryConnector;

    const SLAVE_1: [u8; 7] = [0x02, 0x09, 0x00, 0xC8, 0x32, 0xDB, 0x03];

    fn fast_config() -> LinkConfig {
        LinkConfig {
            read_timeout_ms: 5,
            read_error_backoff_ms: 1,
            max_consecutive_read_errors: 3,
            reconnect_interval_ms: 5,
            join_timeout_ms: 2_000,
            ..LinkConfig::default()
        }
    }

    fn link(connector: &MemoryConnector) -> (ChannelLink, Arc<EventQueue>) {
        let queue = Arc::new(EventQueue::new(1000));
        let link = ChannelLink::new(
            1,
            fast_config(),
            Arc::new(connector.clone()),
            queue.clone(),
        )
        .unwrap();
        (link, queue)
    }

    fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn connect_failure_is_reported_synchronously() {
        let connector = MemoryConnector::new();
        connector.set_unavailable(true);
        let (link, _) = link(&connector);
        assert!(matches!(
            link.connect("mem0", 38400),
            Err(LinkError::Connection { .. })
        ));
        assert_eq!(link.snapshot().connection, ConnectionState::Disconnected);
    }

    #[test]
    fn reads_frames_into_queue_and_health() {
        let connector = MemoryConnector::new();
        let (link, queue) = link(&connector);
        link.connect("mem0", 38400).unwrap();
        assert!(matches!(
            link.connect("mem0", 38400),
            Err(LinkError::AlreadyConnected(1))
        ));

        let mut bad = SLAVE_1;
        bad[5] = 0x00;
        connector.feed(&SLAVE_1);
        connector.feed(&bad);
        wait_for("two frames", || link.checksum_stats().total_packets == 2);

        let events = queue.drain_batch(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sample.channel(), 1);
        let stats = link.checksum_stats();
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.consecutive_errors, 1);

        link.disconnect().unwrap();
        assert_eq!(link.snapshot().connection, ConnectionState::Disconnected);
        // Lifetime statistics survive the disconnect.
        assert_eq!(link.checksum_stats().total_packets, 2);
    }

    #[test]
    fn send_writes_encoded_frame() {
        let connector = MemoryConnector::new();
        let (link, _) = link(&connector);
        let frame = CommandFrame::start(OperationMode::Independent, 300.0, 0.0, 10.0);
        assert!(matches!(link.send(&frame), Err(LinkError::NotConnected(1))));

        link.connect("mem0", 38400).unwrap();
        link.send(&frame).unwrap();
        let expected = CommandEncoder::new(ProtocolVersion::V1).encode(&frame);
        assert_eq!(connector.written(), expected);
        link.disconnect().unwrap();
    }

    #[test]
    fn lost_link_reconnects_and_resets_attempts() {
        let connector = MemoryConnector::new();
        let (link, queue) = link(&connector);
        link.connect("mem0", 38400).unwrap();

        connector.fail_next_opens(2);
        connector.break_link();
        wait_for("reconnect", || {
            let s = link.snapshot();
            s.connection == ConnectionState::Connected && connector.open_attempts() == 4
        });
        assert_eq!(link.snapshot().reconnect_attempts, 0);

        connector.feed(&SLAVE_1);
        wait_for("frame after reconnect", || !queue.is_empty());
        link.disconnect().unwrap();
    }

    #[test]
    fn reconnect_budget_exhausts_without_extra_attempt() {
        let connector = MemoryConnector::new();
        let (link, _) = link(&connector);
        link.connect("mem0", 38400).unwrap();

        connector.set_unavailable(true);
        connector.break_link();
        wait_for("exhaustion", || {
            link.snapshot().connection == ConnectionState::Exhausted
        });
        // Give a stray eleventh attempt time to show up.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(connector.open_attempts(), 1 + 10);
        assert_eq!(link.snapshot().reconnect_attempts, 10);

        // Manual retry is allowed from the terminal state.
        connector.set_unavailable(false);
        link.connect("mem0", 38400).unwrap();
        assert!(link.is_connected());
        link.disconnect().unwrap();
    }

    #[test]
    fn disconnect_interrupts_reconnect_wait() {
        let connector = MemoryConnector::new();
        let queue = Arc::new(EventQueue::new(10));
        let config = LinkConfig {
            reconnect_interval_ms: 60_000,
            ..fast_config()
        };
        let link = ChannelLink::new(2, config, Arc::new(connector.clone()), queue).unwrap();
        link.connect("mem0", 38400).unwrap();
        connector.break_link();
        wait_for("reconnecting", || {
            matches!(
                link.snapshot().connection,
                ConnectionState::Reconnecting { attempt: 1 }
            )
        });

        let started = Instant::now();
        link.disconnect().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(link.snapshot().connection, ConnectionState::Disconnected);
    }

    #[test]
    fn checksum_toggle_applies_to_stream() {
        let connector = MemoryConnector::new();
        let (link, queue) = link(&connector);
        link.connect("mem0", 38400).unwrap();
        link.set_checksum_enabled(false);
        assert!(!link.snapshot().checksum_enabled);

        let mut bad = SLAVE_1;
        bad[5] = 0x00;
        connector.feed(&bad);
        wait_for("unchecked frame", || !queue.is_empty());
        // Unverified frames are not counted as checksum outcomes.
        assert_eq!(link.checksum_stats().total_packets, 0);
        link.disconnect().unwrap();
    }

    #[test]
    fn disconnect_reports_stuck_reader() {
        let connector = MemoryConnector::new();
        let queue = Arc::new(EventQueue::new(10));
        let config = LinkConfig {
            join_timeout_ms: 50,
            ..fast_config()
        };
        let link = ChannelLink::new(3, config, Arc::new(connector.clone()), queue).unwrap();
        link.connect("mem0", 38400).unwrap();

        connector.set_unavailable(true);
        connector.set_failure_delay(Duration::from_millis(300));
        connector.break_link();
        wait_for("stalled reopen", || connector.open_attempts() == 2);

        assert!(matches!(link.disconnect(), Err(LinkError::Timeout(_))));
        assert_eq!(link.snapshot().connection, ConnectionState::Disconnected);
    }

    #[test]
    fn detached_reader_leaves_next_session_alone() {
        let connector = MemoryConnector::new();
        let queue = Arc::new(EventQueue::new(10));
        let config = LinkConfig {
            join_timeout_ms: 50,
            ..fast_config()
        };
        let link = ChannelLink::new(4, config, Arc::new(connector.clone()), queue).unwrap();
        link.connect("mem0", 38400).unwrap();

        connector.set_unavailable(true);
        connector.set_failure_delay(Duration::from_millis(300));
        connector.break_link();
        wait_for("stalled reopen", || connector.open_attempts() == 2);
        assert!(link.disconnect().is_err());

        connector.set_failure_delay(Duration::ZERO);
        connector.set_unavailable(false);
        link.connect("mem0", 38400).unwrap();
        assert_eq!(connector.open_attempts(), 3);

        // Outlive the stalled open and any reconnect budget it could run.
        thread::sleep(Duration::from_millis(600));
        let state = link.snapshot();
        assert_eq!(state.connection, ConnectionState::Connected);
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(connector.open_attempts(), 3);

        connector.feed(&SLAVE_1);
        wait_for("frame on new session", || link.checksum_stats().total_packets == 1);
        link.disconnect().unwrap();
    }

    #[test]
    fn burst_larger_than_buffer_is_fully_decoded() {
        let connector = MemoryConnector::new();
        let (link, queue) = link(&connector);
        link.connect("mem0", 38400).unwrap();

        let burst: Vec<u8> = SLAVE_1.iter().copied().cycle().take(200 * SLAVE_1.len()).collect();
        connector.feed(&burst);
        wait_for("200 frames", || queue.len() == 200);
        assert_eq!(link.snapshot().discarded_bytes, 0);
        link.disconnect().unwrap();
    }

    #[test]
    fn checksum_alerts_reach_stats() {
        let connector = MemoryConnector::new();
        let (link, _) = link(&connector);
        link.connect("mem0", 38400).unwrap();

        let mut bad = SLAVE_1;
        bad[5] = 0x00;
        for _ in 0..5 {
            connector.feed(&bad);
        }
        wait_for("five errors", || link.checksum_stats().total_errors == 5);
        assert_eq!(
            link.checksum_stats().last_notice,
            Some(HealthNotice::ConsecutiveErrors { count: 5 })
        );

        connector.feed(&SLAVE_1);
        wait_for("recovery", || link.checksum_stats().consecutive_errors == 0);
        assert_eq!(
            link.checksum_stats().last_notice,
            Some(HealthNotice::Recovered { after_errors: 5 })
        );
        link.disconnect().unwrap();
    }
}
