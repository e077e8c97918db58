//! # bstream-runner
//!
//! Subscribes to the market streams listed in a JSON config file and logs
//! every decoded record until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! bstream-runner config.json --log-level info
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bstream_md::{BinanceDecoder, Consumer, Record, StreamClient, SubscriptionKey};
use clap::Parser;
use tracing::{error, info};

/// Binance market stream runner.
#[derive(Parser)]
#[command(name = "bstream-runner", about = "Binance market stream runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output. Overrides `log.log_path`.
    #[arg(long)]
    log_dir: Option<String>,
}

/// Logs each record as one JSON row.
struct LogConsumer;

#[async_trait]
impl Consumer for LogConsumer {
    async fn deliver(&self, key: &SubscriptionKey, record: &Record) -> Result<()> {
        let row = record.to_row(Some(record.event_time()))?;
        info!("{key} {}", serde_json::Value::Object(row));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (logging settings live in it)
    let config = bstream_core::config::load_config(&cli.config)?;

    // 2. Initialize logging
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    bstream_core::logging::init_logging(&cli.log_level, log_dir.as_deref(), &config.module_name());

    info!(
        "bstream-runner starting, config={}, log_level={}, {} subscription(s)",
        cli.config.display(),
        cli.log_level,
        config.subscriptions.len()
    );

    // 3. Build the client and register consumers
    let options = config.stream.connection_options()?;
    let client = StreamClient::new(options, config.stream.retry_policy(), BinanceDecoder);
    let consumer: Arc<dyn Consumer> = Arc::new(LogConsumer);

    for name in &config.subscriptions {
        match name.parse::<SubscriptionKey>() {
            Ok(key) => client.subscribe(key, Arc::clone(&consumer)).await?,
            Err(e) => error!("skipping subscription {name:?}: {e}"),
        }
    }

    // 4. Connect; subscriptions are sent once the socket is open
    client.connect();
    info!("connecting to {}, press Ctrl+C to stop", client.connection().options().uri);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    if let Err(e) = client.close().await {
        error!("error closing stream: {e}");
    }

    info!("stopped");
    Ok(())
}
