//! Xeus Modbus Demo
//!
//! Reads one measurement profile and prints it as JSON.
//!
//! ```text
//! demo [host] [port] [ir|ir_raw|nmr|pxe] [config.yaml]
//! ```

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use xeus_modbus::utils::format::format_metrics;
use xeus_modbus::{console_logger, InstrumentClient, InstrumentConfig, ProfileKind};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = match args.get(3) {
        Some(path) => InstrumentConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path))?,
        None => InstrumentConfig::default(),
    };
    if let Some(host) = args.first() {
        config.host = host.clone();
    }
    if let Some(port) = args.get(1) {
        config.port = port.parse().with_context(|| format!("invalid port {}", port))?;
    }
    let profile: ProfileKind = args.get(2).map(String::as_str).unwrap_or("ir").parse()?;

    eprintln!("{}", xeus_modbus::info());
    eprintln!("Connecting to {}:{} (unit {})...", config.host, config.port, config.unit_id);

    let mut client = InstrumentClient::connect(&config)
        .await
        .with_context(|| format!("connecting to {}:{}", config.host, config.port))?;
    client.set_logger(Some(console_logger!()));

    let result = client
        .read_profile(profile)
        .await
        .with_context(|| format!("reading {} profile", profile))?;

    let info = result.read_info();
    if !info.is_complete() {
        eprintln!("Warning: zero-filled ranges {:?}", info.missing);
    }
    if !info.crc_valid() {
        eprintln!("Warning: {} replies failed the CRC check", info.crc_warnings);
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    eprintln!("{}", format_metrics(client.metrics()));
    eprintln!("{:?}", client.get_stats());

    client.close().await?;
    Ok(())
}
