//! Multi-channel acquisition supervisor.
//!
//! Owns up to [`MAX_CHANNELS`] links that all feed one [`EventQueue`], routes
//! commands according to the operation mode and serializes structural changes
//! (mode, channel count) behind a [`TransitionGuard`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::config::{LinkConfig, QueueConfig};
use crate::encoder::{CommandFrame, OperationMode};
use crate::errors::{LinkError, Result};
use crate::health::ChecksumStats;
use crate::link::{ChannelLink, ChannelState};
use crate::lock_unpoisoned as lock;
use crate::protocol::ChannelId;
use crate::queue::{EventPump, EventQueue, QueuedEvent};
use crate::transport::Connector;

pub const MAX_CHANNELS: usize = 8;

/// Fail-fast lock for supervisor-level transitions.
#[derive(Debug, Default)]
pub struct TransitionGuard {
    busy: AtomicBool,
}

/// Held for the duration of one transition; releases the guard on drop.
#[derive(Debug)]
pub struct TransitionToken<'a> {
    busy: &'a AtomicBool,
}

impl TransitionGuard {
    pub fn try_acquire(&self) -> Result<TransitionToken<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| LinkError::TransitionBusy)?;
        Ok(TransitionToken { busy: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for TransitionToken<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct AcquisitionSupervisor {
    link_config: LinkConfig,
    queue_config: QueueConfig,
    connector: Arc<dyn Connector>,
    queue: Arc<EventQueue>,
    channels: Mutex<Vec<Arc<ChannelLink>>>,
    operation_mode: Mutex<OperationMode>,
    transition: TransitionGuard,
}

impl AcquisitionSupervisor {
    pub fn new(
        channel_count: usize,
        link_config: LinkConfig,
        queue_config: QueueConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        check_channel_count(channel_count)?;
        link_config.validate()?;
        queue_config.validate()?;

        let queue = Arc::new(EventQueue::new(queue_config.capacity));
        let supervisor = Self {
            link_config,
            queue_config,
            connector,
            queue,
            channels: Mutex::new(Vec::new()),
            operation_mode: Mutex::new(OperationMode::default()),
            transition: TransitionGuard::default(),
        };
        let links = supervisor.build_links(0..channel_count)?;
        *lock(&supervisor.channels) = links;
        Ok(supervisor)
    }

    fn build_links(&self, ids: std::ops::Range<usize>) -> Result<Vec<Arc<ChannelLink>>> {
        ids.map(|id| {
            ChannelLink::new(
                id as ChannelId,
                self.link_config.clone(),
                self.connector.clone(),
                self.queue.clone(),
            )
            .map(Arc::new)
        })
        .collect()
    }

    fn link(&self, channel: ChannelId) -> Result<Arc<ChannelLink>> {
        lock(&self.channels)
            .get(channel as usize)
            .cloned()
            .ok_or(LinkError::UnknownChannel(channel))
    }

    fn links(&self) -> Vec<Arc<ChannelLink>> {
        lock(&self.channels).clone()
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn operation_mode(&self) -> OperationMode {
        *lock(&self.operation_mode)
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn connect(&self, channel: ChannelId, port: &str, baud: u32) -> Result<()> {
        self.link(channel)?.connect(port, baud)
    }

    pub fn disconnect(&self, channel: ChannelId) -> Result<()> {
        self.link(channel)?.disconnect()
    }

    /// Send a command in the current operation mode.
    ///
    /// Independent mode addresses `channel` only. Parallel mode sends to every
    /// channel, and only when all of them are connected.
    pub fn send_command(&self, channel: ChannelId, frame: CommandFrame) -> Result<()> {
        let target = self.link(channel)?;
        let mode = self.operation_mode();
        let frame = frame.with_operation_mode(mode);
        match mode {
            OperationMode::Independent => target.send(&frame),
            OperationMode::Parallel => self.broadcast(&frame),
        }
    }

    pub fn send_start(
        &self,
        channel: ChannelId,
        max_voltage: f64,
        min_voltage: f64,
        current: f64,
    ) -> Result<()> {
        let frame = CommandFrame::start(self.operation_mode(), max_voltage, min_voltage, current);
        self.send_command(channel, frame)
    }

    pub fn send_stop(&self, channel: ChannelId) -> Result<()> {
        self.send_command(channel, CommandFrame::stop(self.operation_mode()))
    }

    fn broadcast(&self, frame: &CommandFrame) -> Result<()> {
        let links = self.links();
        let not_ready: Vec<ChannelId> = links
            .iter()
            .filter(|l| !l.is_connected())
            .map(|l| l.id())
            .collect();
        if !not_ready.is_empty() {
            warn!("parallel command refused, channels not connected: {:?}", not_ready);
            return Err(LinkError::ChannelsNotReady(not_ready));
        }

        let failures: Vec<(ChannelId, String)> = links
            .iter()
            .filter_map(|l| l.send(frame).err().map(|e| (l.id(), e.to_string())))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(LinkError::PartialSend(failures))
        }
    }

    pub fn snapshot(&self, channel: ChannelId) -> Result<ChannelState> {
        Ok(self.link(channel)?.snapshot())
    }

    pub fn snapshots(&self) -> Vec<ChannelState> {
        self.links().iter().map(|l| l.snapshot()).collect()
    }

    pub fn checksum_stats(&self, channel: ChannelId) -> Result<ChecksumStats> {
        Ok(self.link(channel)?.checksum_stats())
    }

    pub fn reset_checksum_stats(&self, channel: ChannelId) -> Result<()> {
        self.link(channel)?.reset_checksum_stats();
        Ok(())
    }

    pub fn set_checksum_enabled(&self, channel: ChannelId, enabled: bool) -> Result<()> {
        self.link(channel)?.set_checksum_enabled(enabled);
        Ok(())
    }

    /// Take up to one configured batch of events off the shared queue.
    pub fn drain_batch(&self) -> Vec<QueuedEvent> {
        self.queue.drain_batch(self.queue_config.batch_size)
    }

    /// Start a consumer thread that hands batches to `handler` on every tick.
    pub fn spawn_pump<F>(&self, handler: F) -> Result<EventPump>
    where
        F: FnMut(Vec<QueuedEvent>) + Send + 'static,
    {
        EventPump::spawn(self.queue.clone(), &self.queue_config, handler)
    }

    /// Switch operation mode. Connected channels are stopped under the old
    /// mode first; if any stop fails the mode is left unchanged.
    pub fn set_operation_mode(&self, mode: OperationMode) -> Result<()> {
        let _token = self.transition.try_acquire()?;
        let previous = self.operation_mode();
        if previous == mode {
            return Ok(());
        }

        let stop = CommandFrame::stop(previous);
        let failures: Vec<(ChannelId, String)> = self
            .links()
            .iter()
            .filter(|l| l.is_connected())
            .filter_map(|l| l.send(&stop).err().map(|e| (l.id(), e.to_string())))
            .collect();
        if !failures.is_empty() {
            warn!(
                "operation mode change to {:?} aborted, staying in {:?}",
                mode, previous
            );
            *lock(&self.operation_mode) = previous;
            return Err(LinkError::PartialSend(failures));
        }

        *lock(&self.operation_mode) = mode;
        info!("operation mode {:?} -> {:?}", previous, mode);
        Ok(())
    }

    /// Grow or shrink the channel set. Removed channels are disconnected.
    pub fn set_channel_count(&self, count: usize) -> Result<()> {
        let _token = self.transition.try_acquire()?;
        check_channel_count(count)?;
        let previous = self.links();
        if count == previous.len() {
            return Ok(());
        }

        if count > previous.len() {
            let added = self.build_links(previous.len()..count)?;
            lock(&self.channels).extend(added);
        } else {
            let mut failures = Vec::new();
            for link in &previous[count..] {
                if let Err(e) = link.disconnect() {
                    failures.push((link.id(), e.to_string()));
                }
            }
            if !failures.is_empty() {
                *lock(&self.channels) = previous;
                return Err(LinkError::PartialSend(failures));
            }
            lock(&self.channels).truncate(count);
        }
        info!("channel count {} -> {}", previous.len(), count);
        Ok(())
    }

    /// Disconnect every channel and discard queued events.
    pub fn shutdown(&self) {
        for link in self.links() {
            if let Err(e) = link.disconnect() {
                warn!("channel {}: disconnect during shutdown failed: {}", link.id(), e);
            }
        }
        self.queue.clear();
        info!("supervisor shut down");
    }
}

fn check_channel_count(count: usize) -> Result<()> {
    if count == 0 || count > MAX_CHANNELS {
        return Err(LinkError::InvalidConfig(format!(
            "channel count must be 1..={MAX_CHANNELS}, got {count}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::link::ConnectionState;
    use crate::transport::MemoryConnector;

    fn supervisor(channels: usize, connector: &MemoryConnector) -> AcquisitionSupervisor {
        let config = LinkConfig {
            read_timeout_ms: 5,
            read_error_backoff_ms: 1,
            reconnect_interval_ms: 5,
            ..LinkConfig::default()
        };
        AcquisitionSupervisor::new(
            channels,
            config,
            QueueConfig::default(),
            Arc::new(connector.clone()),
        )
        .unwrap()
    }

    #[test]
    fn transition_guard_is_exclusive() {
        let guard = TransitionGuard::default();
        let token = guard.try_acquire().unwrap();
        assert!(guard.is_busy());
        assert!(matches!(guard.try_acquire(), Err(LinkError::TransitionBusy)));
        drop(token);
        assert!(guard.try_acquire().is_ok());
    }

    #[test]
    fn channel_count_bounds() {
        let connector = MemoryConnector::new();
        assert!(AcquisitionSupervisor::new(
            0,
            LinkConfig::default(),
            QueueConfig::default(),
            Arc::new(connector.clone())
        )
        .is_err());
        let sup = supervisor(2, &connector);
        assert!(matches!(
            sup.set_channel_count(9),
            Err(LinkError::InvalidConfig(_))
        ));
        assert_eq!(sup.channel_count(), 2);
        sup.set_channel_count(4).unwrap();
        assert_eq!(sup.snapshots().len(), 4);
        assert_eq!(
            sup.snapshot(3).unwrap().connection,
            ConnectionState::Disconnected
        );
        assert!(matches!(sup.snapshot(4), Err(LinkError::UnknownChannel(4))));
    }

    #[test]
    fn shrinking_disconnects_removed_channels() {
        let connector = MemoryConnector::new();
        let sup = supervisor(2, &connector);
        sup.connect(1, "mem1", 38400).unwrap();
        sup.set_channel_count(1).unwrap();
        assert_eq!(sup.channel_count(), 1);
        assert!(matches!(sup.disconnect(1), Err(LinkError::UnknownChannel(1))));
    }

    #[test]
    fn shrink_rolls_back_when_a_reader_will_not_stop() {
        let connector = MemoryConnector::new();
        let config = LinkConfig {
            read_timeout_ms: 5,
            read_error_backoff_ms: 1,
            reconnect_interval_ms: 5,
            join_timeout_ms: 50,
            ..LinkConfig::default()
        };
        let sup = AcquisitionSupervisor::new(
            2,
            config,
            QueueConfig::default(),
            Arc::new(connector.clone()),
        )
        .unwrap();
        sup.connect(1, "mem1", 38400).unwrap();

        connector.set_unavailable(true);
        connector.set_failure_delay(Duration::from_millis(300));
        connector.break_link();
        let deadline = Instant::now() + Duration::from_secs(5);
        while connector.open_attempts() < 2 {
            assert!(Instant::now() < deadline, "reopen never started");
            thread::sleep(Duration::from_millis(5));
        }

        match sup.set_channel_count(1) {
            Err(LinkError::PartialSend(failures)) => assert_eq!(failures[0].0, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sup.channel_count(), 2);
        assert_eq!(
            sup.snapshot(1).unwrap().connection,
            ConnectionState::Disconnected
        );
        assert!(!sup.transition.is_busy());
    }

    #[test]
    fn parallel_requires_every_channel() {
        let connector = MemoryConnector::new();
        let sup = supervisor(2, &connector);
        sup.set_operation_mode(OperationMode::Parallel).unwrap();
        sup.connect(0, "mem0", 38400).unwrap();

        match sup.send_start(0, 300.0, 0.0, 5.0) {
            Err(LinkError::ChannelsNotReady(ids)) => assert_eq!(ids, vec![1]),
            other => panic!("unexpected {other:?}"),
        }
        // Nothing reached the connected channel.
        assert!(connector.written().is_empty());
        sup.shutdown();
    }

    #[test]
    fn independent_addresses_one_channel() {
        let connector = MemoryConnector::new();
        let sup = supervisor(2, &connector);
        assert!(matches!(
            sup.send_stop(0),
            Err(LinkError::NotConnected(0))
        ));
        sup.connect(0, "mem0", 38400).unwrap();
        sup.send_start(0, 300.0, 0.0, 5.0).unwrap();
        let written = connector.written();
        assert_eq!(written.len(), 9);
        assert_eq!(written[1], 0x01);
        sup.shutdown();
        assert_eq!(
            sup.snapshot(0).unwrap().connection,
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn mode_change_stops_connected_channels() {
        let connector = MemoryConnector::new();
        let sup = supervisor(1, &connector);
        sup.connect(0, "mem0", 38400).unwrap();
        sup.set_operation_mode(OperationMode::Parallel).unwrap();
        assert_eq!(sup.operation_mode(), OperationMode::Parallel);
        let written = connector.written();
        assert_eq!(written.len(), 9);
        assert_eq!(written[1], 0x00);
        sup.shutdown();
    }

    #[test]
    fn failed_mode_change_keeps_previous_mode() {
        let connector = MemoryConnector::new();
        let config = LinkConfig {
            read_timeout_ms: 5,
            read_error_backoff_ms: 1,
            // Keep the broken link in Connected long enough for the stop to fail.
            max_consecutive_read_errors: 5_000,
            ..LinkConfig::default()
        };
        let sup = AcquisitionSupervisor::new(
            1,
            config,
            QueueConfig::default(),
            Arc::new(connector.clone()),
        )
        .unwrap();
        sup.connect(0, "mem0", 38400).unwrap();
        connector.break_link();

        match sup.set_operation_mode(OperationMode::Parallel) {
            Err(LinkError::PartialSend(failures)) => assert_eq!(failures[0].0, 0),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sup.operation_mode(), OperationMode::Independent);
        sup.shutdown();
    }
}
