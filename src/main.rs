use std::process::exit;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::warn;

use sm1_link::logging::init_logging;
use sm1_link::simulator::{BenchSender, BenchTiming};
use sm1_link::{
    available_ports, AcquisitionSupervisor, Connector, DecodedSample, LinkConfig, LiveView,
    ProtocolVersion, QueueConfig, SerialConnector, DEFAULT_BAUD,
};

#[derive(Parser, Debug)]
#[command(name = "sm1", version, about = "Monitor and exercise SM1 serial links")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Connect to a master and print decoded samples
    Monitor(MonitorArgs),
    /// Play the master side of the link on a serial port
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct MonitorArgs {
    /// Serial port path (e.g., /dev/ttyUSB0)
    port: String,
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
    #[arg(long, default_value = "v1")]
    protocol: ProtocolVersion,
    /// Accept frames without verifying their checksum
    #[arg(long)]
    no_checksum: bool,
    /// Stop after this many seconds (runs until killed otherwise)
    #[arg(long)]
    seconds: Option<u64>,
    /// Send a start command with these set-points after connecting
    #[arg(
        long,
        num_args = 3,
        value_names = ["MAX_V", "MIN_V", "CURRENT_A"],
        allow_negative_numbers = true
    )]
    start: Option<Vec<f64>>,
    /// Print samples as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Serial port path
    port: String,
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
    /// Number of slave modules to emulate (1-31)
    #[arg(long, default_value_t = 10)]
    slaves: u8,
    #[arg(long, default_value = "v1")]
    protocol: ProtocolVersion,
    /// Stop after this many cycles (runs until killed otherwise)
    #[arg(long)]
    cycles: Option<u64>,
}

fn main() {
    init_logging();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Ports => list_ports(),
        Command::Monitor(args) => monitor(args),
        Command::Simulate(args) => simulate(args),
    }
}

fn list_ports() -> Result<()> {
    let ports = available_ports().context("failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn monitor(args: MonitorArgs) -> Result<()> {
    let config = LinkConfig {
        protocol: args.protocol,
        checksum_enabled: !args.no_checksum,
        ..LinkConfig::default()
    };
    let queue_config = QueueConfig::default();
    let connector = Arc::new(SerialConnector::new(config.read_timeout()));
    let supervisor = AcquisitionSupervisor::new(1, config, queue_config.clone(), connector)?;

    supervisor
        .connect(0, &args.port, args.baud)
        .with_context(|| format!("could not connect to {}", args.port))?;

    let started = match args.start.as_deref() {
        Some(&[max_v, min_v, current]) => {
            supervisor
                .send_start(0, max_v, min_v, current)
                .context("start command failed")?;
            true
        }
        _ => false,
    };

    let deadline = args.seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut view = LiveView::new();
    while deadline.map_or(true, |d| Instant::now() < d) {
        for event in supervisor.drain_batch() {
            view.apply(&event);
            if args.json {
                println!("{}", serde_json::to_string(&event.sample)?);
            } else {
                print_sample(&event.sample, &view);
            }
        }
        thread::sleep(queue_config.tick());
    }

    if started {
        if let Err(e) = supervisor.send_stop(0) {
            warn!("stop command failed: {e}");
        }
    }
    let stats = supervisor.checksum_stats(0)?;
    let state = supervisor.snapshot(0)?;
    supervisor.shutdown();

    println!("--- {} ({:?}) ---", args.port, state.connection);
    println!("packets: {}", view.packet_count());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if supervisor.queue().dropped() > 0 {
        println!("dropped events: {}", supervisor.queue().dropped());
    }
    Ok(())
}

fn print_sample(sample: &DecodedSample, view: &LiveView) {
    match *sample {
        DecodedSample::SystemVoltage {
            channel, voltage, ..
        } => {
            println!(
                "[ch{channel}] system {voltage:7.1} V  {:7.2} A",
                view.system_current(channel)
            );
        }
        DecodedSample::SlaveReading {
            channel,
            slave_id,
            current,
            temperature_c,
            dab_ok,
            ..
        } => {
            println!(
                "[ch{channel}] slave {slave_id:2}  {current:7.2} A  {temperature_c:5.1} °C  DAB {}",
                if dab_ok { "OK" } else { "FAULT" }
            );
        }
    }
}

fn simulate(args: SimulateArgs) -> Result<()> {
    // Short timeout so polling for commands does not stall the frame cadence.
    let connector = SerialConnector::new(Duration::from_millis(10));
    let mut transport = connector
        .open(&args.port, args.baud)
        .with_context(|| format!("could not open {}", args.port))?;
    let mut sender = BenchSender::new(args.slaves, args.protocol)?;
    println!(
        "Sending {} slaves ({}) on {} at {} baud",
        args.slaves, args.protocol, args.port, args.baud
    );
    let running = AtomicBool::new(true);
    let cycles = sender.run(
        transport.as_mut(),
        &BenchTiming::default(),
        args.cycles,
        &running,
    )?;
    println!("Done after {cycles} cycles.");
    Ok(())
}
