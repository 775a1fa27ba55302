//! Bench sender that plays the master side of the link.
//!
//! Emits a system-voltage frame every tenth cycle and one reading per slave
//! each cycle, with values on a bounded random walk. Commands arriving from
//! the supervisor side are decoded and logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::encoder::{CommandEncoder, CommandFrame};
use crate::errors::{LinkError, Result};
use crate::protocol::{
    checksum, clamp_i16, ProtocolVersion, ETX, INBOUND_FRAME_LEN, MAX_SLAVE_ID, STX,
};
use crate::transport::Transport;

const VOLTAGE_EVERY: u64 = 10;
const INITIAL_VOLTAGE: f64 = 800.0;
const INITIAL_TEMPERATURE: f64 = 25.0;
const CURRENT_LIMIT: f64 = 80.0;
const DAB_OK_PROBABILITY: f64 = 0.95;

/// Build a system-voltage frame (slave id 0).
pub fn encode_system_voltage(voltage: f64) -> [u8; INBOUND_FRAME_LEN] {
    let [hi, lo] = clamp_i16(voltage * 10.0).to_be_bytes();
    seal([STX, 0x00, hi, lo, 0x00, 0x00, ETX])
}

/// Build a slave reading frame. `slave_id` is masked to five bits.
pub fn encode_slave_reading(
    slave_id: u8,
    current: f64,
    temperature_c: f64,
    dab_ok: bool,
    protocol: ProtocolVersion,
) -> [u8; INBOUND_FRAME_LEN] {
    let id_byte = ((slave_id & MAX_SLAVE_ID) << 3) | u8::from(dab_ok);
    let [hi, lo] = protocol.encode_current(current);
    let temp = (temperature_c * 2.0).round().clamp(0.0, u8::MAX as f64) as u8;
    seal([STX, id_byte, hi, lo, temp, 0x00, ETX])
}

fn seal(mut frame: [u8; INBOUND_FRAME_LEN]) -> [u8; INBOUND_FRAME_LEN] {
    frame[5] = checksum(&frame[1..5]);
    frame
}

/// Pauses between frames, matching what a real master produces.
#[derive(Debug, Clone)]
pub struct BenchTiming {
    pub after_voltage: Duration,
    pub after_slave: Duration,
    pub after_cycle: Duration,
}

impl Default for BenchTiming {
    fn default() -> Self {
        Self {
            after_voltage: Duration::from_millis(20),
            after_slave: Duration::from_millis(50),
            after_cycle: Duration::from_millis(200),
        }
    }
}

impl BenchTiming {
    /// No pauses at all.
    pub fn immediate() -> Self {
        Self {
            after_voltage: Duration::ZERO,
            after_slave: Duration::ZERO,
            after_cycle: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SlaveState {
    current: f64,
    temperature_c: f64,
}

pub struct BenchSender {
    protocol: ProtocolVersion,
    rng: StdRng,
    voltage: f64,
    slaves: Vec<SlaveState>,
    cycle: u64,
    inbound: Vec<u8>,
}

impl BenchSender {
    pub fn new(slaves: u8, protocol: ProtocolVersion) -> Result<Self> {
        Self::with_rng(slaves, protocol, StdRng::from_entropy())
    }

    /// Deterministic sender for reproducible runs.
    pub fn seeded(slaves: u8, protocol: ProtocolVersion, seed: u64) -> Result<Self> {
        Self::with_rng(slaves, protocol, StdRng::seed_from_u64(seed))
    }

    fn with_rng(slaves: u8, protocol: ProtocolVersion, rng: StdRng) -> Result<Self> {
        if slaves == 0 || slaves > MAX_SLAVE_ID {
            return Err(LinkError::InvalidConfig(format!(
                "slave count must be 1..={MAX_SLAVE_ID}, got {slaves}"
            )));
        }
        let initial = SlaveState {
            current: 0.0,
            temperature_c: INITIAL_TEMPERATURE,
        };
        Ok(Self {
            protocol,
            rng,
            voltage: INITIAL_VOLTAGE,
            slaves: vec![initial; slaves as usize],
            cycle: 0,
            inbound: Vec::new(),
        })
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Advance the random walk one cycle and return the frames to send, in order.
    pub fn next_cycle(&mut self) -> Vec<[u8; INBOUND_FRAME_LEN]> {
        let mut frames = Vec::with_capacity(self.slaves.len() + 1);
        if self.cycle % VOLTAGE_EVERY == 0 {
            self.voltage = (self.voltage + self.rng.gen_range(-10.0..=10.0)).clamp(0.0, 1000.0);
            frames.push(encode_system_voltage(self.voltage));
        }
        for (i, slave) in self.slaves.iter_mut().enumerate() {
            slave.current = (slave.current + self.rng.gen_range(-2.0..=2.0))
                .clamp(-CURRENT_LIMIT, CURRENT_LIMIT);
            slave.temperature_c =
                (slave.temperature_c + self.rng.gen_range(-0.5..=0.5)).clamp(0.0, 100.0);
            let dab_ok = self.rng.gen_bool(DAB_OK_PROBABILITY);
            frames.push(encode_slave_reading(
                i as u8 + 1,
                slave.current,
                slave.temperature_c,
                dab_ok,
                self.protocol,
            ));
        }
        self.cycle += 1;
        frames
    }

    /// Send cycles until `cycles` are done (forever when `None`) or `running`
    /// is cleared. Returns the number of completed cycles.
    pub fn run(
        &mut self,
        transport: &mut dyn Transport,
        timing: &BenchTiming,
        cycles: Option<u64>,
        running: &AtomicBool,
    ) -> Result<u64> {
        let mut done = 0;
        while running.load(Ordering::Acquire) && cycles.map_or(true, |n| done < n) {
            let voltage_cycle = self.cycle % VOLTAGE_EVERY == 0;
            for (i, frame) in self.next_cycle().iter().enumerate() {
                transport.write_all(frame)?;
                debug!("sent {:02X?}", frame);
                let pause = if voltage_cycle && i == 0 {
                    timing.after_voltage
                } else {
                    timing.after_slave
                };
                sleep_nonzero(pause);
            }
            transport.flush()?;
            self.poll_commands(transport)?;
            done += 1;
            sleep_nonzero(timing.after_cycle);
        }
        info!("bench sender stopped after {} cycles", done);
        Ok(done)
    }

    /// Read whatever the other side sent and log any complete command frames.
    fn poll_commands(&mut self, transport: &mut dyn Transport) -> Result<()> {
        let mut buf = [0u8; 64];
        match transport.read(&mut buf) {
            Ok(n) => self.inbound.extend_from_slice(&buf[..n]),
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) => {}
            Err(e) => return Err(e.into()),
        }
        for command in self.take_commands() {
            info!(
                "received {:?} ({:?}) max={:.0}V min={:.0}V current={:.1}A",
                command.mode,
                command.operation_mode,
                command.max_voltage,
                command.min_voltage,
                command.current
            );
        }
        Ok(())
    }

    fn take_commands(&mut self) -> Vec<CommandFrame> {
        let encoder = CommandEncoder::new(self.protocol);
        let len = encoder.frame_len();
        let mut commands = Vec::new();
        let mut start = 0;
        while start + len <= self.inbound.len() {
            if self.inbound[start] != STX {
                start += 1;
                continue;
            }
            match encoder.decode(&self.inbound[start..start + len]) {
                Ok(command) => {
                    commands.push(command);
                    start += len;
                }
                Err(e) => {
                    debug!("skipping byte: {}", e);
                    start += 1;
                }
            }
        }
        self.inbound.drain(..start);
        commands
    }
}

fn sleep_nonzero(d: Duration) {
    if !d.is_zero() {
        thread::sleep(d);
    }
}
