//! SM1 serial-link acquisition engine with optional Python bindings.
//!
//! A master controller streams fixed 7-byte telemetry frames (system voltage
//! and per-module current, temperature and DAB_OK status) over a serial line
//! and accepts 9- or 10-byte start/stop commands. This crate decodes that
//! stream on one reader thread per channel, tracks checksum health, reconnects
//! lost links and hands samples to a single consumer through a bounded queue.
//!
//! # Threading
//!
//! ```text
//!  reader (sm1-link-0) ─┐
//!  reader (sm1-link-1) ─┼─> EventQueue (drop-oldest) ─> EventPump / drain_batch ─> LiveView
//!  reader (sm1-link-N) ─┘
//! ```
//!
//! Each reader exclusively owns its port. Commands reach the port through the
//! reader, never directly.

use std::sync::{Mutex, MutexGuard};

pub mod config;
pub mod decoder;
pub mod encoder;
mod errors;
pub mod health;
pub mod link;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod simulator;
pub mod supervisor;
pub mod transport;
pub mod view;

#[cfg(feature = "python")]
mod python;

pub use config::{HealthConfig, LinkConfig, QueueConfig, DEFAULT_BAUD};
pub use decoder::{ChecksumStatus, DecodedSample, FrameDecoder, FrameOutcome};
pub use encoder::{CommandEncoder, CommandFrame, CommandMode, OperationMode};
pub use errors::*;
pub use health::{ChecksumMonitor, ChecksumStats, HealthNotice};
pub use link::{ChannelLink, ChannelState, ConnectionState};
pub use protocol::{ChannelId, ProtocolVersion};
pub use queue::{EventPump, EventQueue, QueuedEvent};
pub use supervisor::{AcquisitionSupervisor, TransitionGuard, MAX_CHANNELS};
pub use transport::{available_ports, Connector, MemoryConnector, SerialConnector, Transport};
pub use view::{LiveView, ModuleRow};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
