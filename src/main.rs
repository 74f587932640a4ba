//! Command-line entry point.
//!
//! Run with: `ble-gatt-client [ADDRESS]`

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use ble_gatt_client::{
    Acquisition, BtleCentral, ClientConfig, GattClient, Outcome, Report, TargetSpec,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Find the BLE peripheral and exercise its custom GATT service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Peripheral address, overriding the configured target.
    address: Option<String>,

    /// Match on manufacturer data instead of the address.
    #[arg(long, conflicts_with = "address")]
    manufacturer: bool,

    /// Use repeated address lookups instead of sub-scans.
    #[arg(long, conflicts_with = "manufacturer")]
    lookup: bool,

    /// TOML configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Give up scanning after this many seconds (default: wait forever).
    #[arg(long, value_name = "SECS")]
    scan_timeout: Option<f64>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn build_config(&self) -> ble_gatt_client::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };

        if let Some(address) = &self.address {
            config = config.with_target(TargetSpec::address(address));
        } else if self.manufacturer {
            let target = config.manufacturer_target();
            config = config.with_target(target);
        }

        if let Some(secs) = self.scan_timeout {
            let timeout =
                Duration::try_from_secs_f64(secs).map_err(|_| ble_gatt_client::Error::InvalidConfig {
                    reason: format!("{} is not a valid scan timeout", secs),
                })?;
            config = config.with_scan_timeout(Some(timeout));
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ble_gatt_client={}", level)));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_report(report: &Report) {
    println!(
        "\n{} ({})",
        report.device.display_name(),
        report.device.address
    );
    for entry in &report.characteristics {
        match &entry.outcome {
            Ok(Outcome::Read { value }) => println!("  {}  {}", entry.uuid, value),
            Ok(Outcome::VerifiedWrite { before, after }) => {
                println!("  {}  {} -> {}", entry.uuid, before, after)
            }
            Ok(Outcome::Notifications(received)) => {
                println!("  {}  {} notifications", entry.uuid, received.len());
                for n in received {
                    println!(
                        "    +{:.3}s  {}",
                        n.received_after.as_secs_f64(),
                        String::from_utf8_lossy(&n.notification.value)
                    );
                }
            }
            Err(e) => println!("  {}  FAILED: {}", entry.uuid, e),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match cli.build_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let central = match BtleCentral::new().await {
        Ok(central) => central,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            ctrl_c.cancel();
        }
    });

    let acquisition = if cli.lookup {
        Acquisition::Lookup
    } else {
        Acquisition::Scan
    };
    let client = GattClient::new(central, config).with_acquisition(acquisition);

    match client.run(&cancel).await {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
