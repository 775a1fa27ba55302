//! Python bindings (`sm1_link` module).

use std::sync::Arc;

use pyo3::exceptions::{
    PyConnectionError, PyIOError, PyRuntimeError, PyTimeoutError, PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::config::{LinkConfig, QueueConfig, DEFAULT_BAUD};
use crate::decoder::DecodedSample;
use crate::encoder::OperationMode;
use crate::errors::LinkError;
use crate::logging;
use crate::protocol::{ChannelId, ProtocolVersion};
use crate::queue::QueuedEvent;
use crate::supervisor::AcquisitionSupervisor;
use crate::transport::{available_ports, SerialConnector};

fn to_py_err(e: LinkError) -> PyErr {
    let msg = e.to_string();
    match e {
        LinkError::Connection { .. } => PyErr::new::<PyConnectionError, _>(msg),
        LinkError::Timeout(_) => PyErr::new::<PyTimeoutError, _>(msg),
        LinkError::UnknownChannel(_) | LinkError::InvalidConfig(_) => {
            PyErr::new::<PyValueError, _>(msg)
        }
        LinkError::Io(_) | LinkError::Serial(_) | LinkError::Protocol(_) => {
            PyErr::new::<PyIOError, _>(msg)
        }
        _ => PyErr::new::<PyRuntimeError, _>(msg),
    }
}

fn sample_to_dict<'py>(py: Python<'py>, event: &QueuedEvent) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("seq", event.seq)?;
    dict.set_item("channel", event.sample.channel())?;
    dict.set_item("timestamp_ms", event.sample.timestamp_ms())?;
    match &event.sample {
        DecodedSample::SystemVoltage { voltage, .. } => {
            dict.set_item("kind", "system_voltage")?;
            dict.set_item("voltage", *voltage)?;
        }
        DecodedSample::SlaveReading {
            slave_id,
            current,
            temperature_c,
            dab_ok,
            ..
        } => {
            dict.set_item("kind", "slave_reading")?;
            dict.set_item("slave_id", *slave_id)?;
            dict.set_item("current", *current)?;
            dict.set_item("temperature_c", *temperature_c)?;
            dict.set_item("dab_ok", *dab_ok)?;
        }
    }
    Ok(dict)
}

/// Multi-channel SM1 acquisition supervisor.
///
/// Example:
///     >>> sup = Supervisor(channels=1)
///     >>> sup.connect(0, "/dev/ttyUSB0")
///     >>> sup.send_start(0, max_voltage=300, min_voltage=0, current=10)
///     >>> samples = sup.poll(10)
///     >>> sup.send_stop(0)
///     >>> sup.disconnect(0)
#[pyclass(name = "Supervisor")]
struct PySupervisor {
    inner: Arc<AcquisitionSupervisor>,
}

#[pymethods]
impl PySupervisor {
    #[new]
    #[pyo3(signature = (channels=1, protocol="v1", checksum=true))]
    fn new(channels: usize, protocol: &str, checksum: bool) -> PyResult<Self> {
        let protocol: ProtocolVersion = protocol.parse().map_err(to_py_err)?;
        let config = LinkConfig {
            protocol,
            checksum_enabled: checksum,
            ..LinkConfig::default()
        };
        let connector = Arc::new(SerialConnector::new(config.read_timeout()));
        AcquisitionSupervisor::new(channels, config, QueueConfig::default(), connector)
            .map(|s| PySupervisor { inner: Arc::new(s) })
            .map_err(to_py_err)
    }

    /// List serial port paths reported by the OS.
    #[staticmethod]
    fn ports() -> PyResult<Vec<String>> {
        available_ports().map_err(to_py_err)
    }

    /// Open a serial port on `channel`.
    ///
    /// Raises:
    ///     ConnectionError: If the port cannot be opened
    #[pyo3(signature = (channel, port, baud=DEFAULT_BAUD))]
    fn connect(&self, py: Python<'_>, channel: ChannelId, port: &str, baud: u32) -> PyResult<()> {
        let inner = self.inner.clone();
        py.detach(|| inner.connect(channel, port, baud))
            .map_err(to_py_err)
    }

    fn disconnect(&self, py: Python<'_>, channel: ChannelId) -> PyResult<()> {
        let inner = self.inner.clone();
        py.detach(|| inner.disconnect(channel)).map_err(to_py_err)
    }

    /// Send a start command. In parallel mode it goes to every channel.
    fn send_start(
        &self,
        py: Python<'_>,
        channel: ChannelId,
        max_voltage: f64,
        min_voltage: f64,
        current: f64,
    ) -> PyResult<()> {
        let inner = self.inner.clone();
        py.detach(|| inner.send_start(channel, max_voltage, min_voltage, current))
            .map_err(to_py_err)
    }

    fn send_stop(&self, py: Python<'_>, channel: ChannelId) -> PyResult<()> {
        let inner = self.inner.clone();
        py.detach(|| inner.send_stop(channel)).map_err(to_py_err)
    }

    /// Enable or disable checksum validation on a channel.
    fn set_checksum(&self, channel: ChannelId, enabled: bool) -> PyResult<()> {
        self.inner
            .set_checksum_enabled(channel, enabled)
            .map_err(to_py_err)
    }

    /// Switch between "independent" and "parallel" operation.
    fn set_operation_mode(&self, py: Python<'_>, mode: &str) -> PyResult<()> {
        let mode = match mode.to_ascii_lowercase().as_str() {
            "independent" => OperationMode::Independent,
            "parallel" => OperationMode::Parallel,
            other => {
                return Err(PyErr::new::<PyValueError, _>(format!(
                    "unknown operation mode '{other}'"
                )))
            }
        };
        let inner = self.inner.clone();
        py.detach(|| inner.set_operation_mode(mode))
            .map_err(to_py_err)
    }

    /// Take up to `max` queued samples as dictionaries, oldest first.
    #[pyo3(signature = (max=10))]
    fn poll<'py>(&self, py: Python<'py>, max: usize) -> PyResult<Vec<Bound<'py, PyDict>>> {
        self.inner
            .queue()
            .drain_batch(max)
            .iter()
            .map(|event| sample_to_dict(py, event))
            .collect()
    }

    /// Connection state of a channel as a dictionary.
    fn state<'py>(&self, py: Python<'py>, channel: ChannelId) -> PyResult<Bound<'py, PyDict>> {
        let state = self.inner.snapshot(channel).map_err(to_py_err)?;
        let dict = PyDict::new(py);
        dict.set_item("channel", state.id)?;
        dict.set_item("connection", format!("{:?}", state.connection))?;
        dict.set_item("connected", state.connection.is_active())?;
        dict.set_item("checksum_enabled", state.checksum_enabled)?;
        dict.set_item("reconnect_attempts", state.reconnect_attempts)?;
        dict.set_item("discarded_bytes", state.discarded_bytes)?;
        dict.set_item("port", state.port)?;
        dict.set_item("baud", state.baud)?;
        dict.set_item("protocol", state.protocol.to_string())?;
        Ok(dict)
    }

    /// Checksum statistics of a channel as a dictionary.
    fn health<'py>(&self, py: Python<'py>, channel: ChannelId) -> PyResult<Bound<'py, PyDict>> {
        let stats = self.inner.checksum_stats(channel).map_err(to_py_err)?;
        let dict = PyDict::new(py);
        dict.set_item("total_packets", stats.total_packets)?;
        dict.set_item("total_errors", stats.total_errors)?;
        dict.set_item("consecutive_errors", stats.consecutive_errors)?;
        dict.set_item("recent_error_rate", stats.recent_error_rate)?;
        dict.set_item("recent_window", stats.recent_window)?;
        dict.set_item("since_last_alert_ms", stats.since_last_alert_ms)?;
        dict.set_item("last_notice", stats.last_notice.map(|n| format!("{n:?}")))?;
        Ok(dict)
    }

    /// Events evicted from the full queue so far.
    #[getter]
    fn dropped(&self) -> u64 {
        self.inner.queue().dropped()
    }

    #[getter]
    fn channel_count(&self) -> usize {
        self.inner.channel_count()
    }

    /// Disconnect every channel.
    fn shutdown(&self, py: Python<'_>) {
        let inner = self.inner.clone();
        py.detach(|| inner.shutdown());
    }

    fn __repr__(&self) -> String {
        format!(
            "Supervisor(channels={}, mode={:?})",
            self.inner.channel_count(),
            self.inner.operation_mode()
        )
    }
}

/// Install the stderr logger. `level` overrides `SM1_LOG`/`RUST_LOG`.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(level: Option<&str>) -> PyResult<()> {
    let level = level
        .map(logging::parse_level)
        .transpose()
        .map_err(to_py_err)?;
    logging::init_logging_with(level);
    Ok(())
}

#[pymodule]
fn sm1_link(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySupervisor>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;

    m.add("DEFAULT_BAUD", DEFAULT_BAUD)?;
    m.add("MAX_CHANNELS", crate::supervisor::MAX_CHANNELS)?;

    Ok(())
}
