// src/bin/uart_echo.rs
//! Runs one UART echo test session and prints the report as JSON.
//!
//! The session talks to the in-process simulated peripheral, placed at the
//! address named by the trigger.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use uart_echo::ble::simulated::{EchoBehavior, SimPeripheralConfig, SimUartPeripheral};
use uart_echo::echo::cache::HandleCache;
use uart_echo::echo::correlator::EventCorrelator;
use uart_echo::{EchoConfig, EchoPlan, SessionDriver, TestTrigger};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SimEcho {
    Lossless,
    Lowercase,
    Corrupt,
    Drop,
}

impl From<SimEcho> for EchoBehavior {
    fn from(value: SimEcho) -> Self {
        match value {
            SimEcho::Lossless => EchoBehavior::Lossless,
            SimEcho::Lowercase => EchoBehavior::Lowercase,
            SimEcho::Corrupt => EchoBehavior::Corrupt,
            SimEcho::Drop => EchoBehavior::Drop,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "uart-echo", about = "BLE UART echo test session")]
struct Args {
    /// Test trigger, "<mac>,<address type code>"
    #[arg(long)]
    trigger: String,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    duration_ms: Option<u64>,

    #[arg(long)]
    min_size: Option<usize>,

    #[arg(long)]
    mtu: Option<usize>,

    /// Send the single fixed probe instead of the timed workload
    #[arg(long)]
    single: bool,

    /// Seed for payload generation
    #[arg(long)]
    seed: Option<u64>,

    /// How the simulated peripheral echoes
    #[arg(long, value_enum, default_value = "lossless")]
    sim_echo: SimEcho,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EchoConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EchoConfig::default(),
    };
    if let Some(duration_ms) = args.duration_ms {
        config.run_duration_ms = duration_ms;
    }
    if let Some(min_size) = args.min_size {
        config.min_payload_size = min_size;
    }
    if args.mtu.is_some() {
        config.mtu = args.mtu;
    }
    config.validate()?;

    let trigger = TestTrigger::parse(&args.trigger)?;
    let plan = if args.single {
        EchoPlan::probe()
    } else {
        EchoPlan::from_config(&config)
    };

    let (peripheral, events) = SimUartPeripheral::new(SimPeripheralConfig {
        address: trigger.address,
        echo: args.sim_echo.into(),
        latency: Duration::from_millis(1),
        ..Default::default()
    });

    let mut driver = SessionDriver::new(
        peripheral,
        Arc::new(EventCorrelator::new(events)),
        HandleCache::new(),
        config,
    );
    if let Some(seed) = args.seed {
        driver = driver.with_seed(seed);
    }

    let report = driver.run(&trigger, &plan).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.passed {
        std::process::exit(1);
    }
    Ok(())
}
