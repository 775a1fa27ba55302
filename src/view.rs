//! Consumer-side aggregate of the sample stream.
//!
//! Only the thread draining the event queue mutates a [`LiveView`]; readers
//! never touch it.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::decoder::DecodedSample;
use crate::protocol::ChannelId;
use crate::queue::QueuedEvent;

/// Latest reading of one converter module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleRow {
    pub channel: ChannelId,
    pub slave_id: u8,
    pub current: f64,
    pub temperature_c: f64,
    pub dab_ok: bool,
    pub updated_ms: u64,
}

#[derive(Debug, Default, Clone)]
pub struct LiveView {
    rows: BTreeMap<(ChannelId, u8), ModuleRow>,
    voltages: BTreeMap<ChannelId, f64>,
    packet_count: u64,
}

impl LiveView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &QueuedEvent) {
        self.packet_count += 1;
        match event.sample {
            DecodedSample::SystemVoltage {
                channel, voltage, ..
            } => {
                self.voltages.insert(channel, voltage);
            }
            DecodedSample::SlaveReading {
                channel,
                slave_id,
                current,
                temperature_c,
                dab_ok,
                timestamp_ms,
            } => {
                self.rows.insert(
                    (channel, slave_id),
                    ModuleRow {
                        channel,
                        slave_id,
                        current,
                        temperature_c,
                        dab_ok,
                        updated_ms: timestamp_ms,
                    },
                );
            }
        }
    }

    pub fn apply_all<'a, I: IntoIterator<Item = &'a QueuedEvent>>(&mut self, events: I) {
        for event in events {
            self.apply(event);
        }
    }

    /// Last reported system voltage of a channel.
    pub fn system_voltage(&self, channel: ChannelId) -> Option<f64> {
        self.voltages.get(&channel).copied()
    }

    /// Sum of the latest module currents on a channel.
    pub fn system_current(&self, channel: ChannelId) -> f64 {
        self.modules(channel).map(|row| row.current).sum()
    }

    /// Module rows of a channel ordered by slave id.
    pub fn modules(&self, channel: ChannelId) -> impl Iterator<Item = &ModuleRow> + '_ {
        self.rows
            .range((channel, 0)..=(channel, u8::MAX))
            .map(|(_, row)| row)
    }

    pub fn module(&self, channel: ChannelId, slave_id: u8) -> Option<&ModuleRow> {
        self.rows.get(&(channel, slave_id))
    }

    /// Samples applied since creation or the last reset.
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn reset(&mut self) {
        self.rows.clear();
        self.voltages.clear();
        self.packet_count = 0;
    }
}
