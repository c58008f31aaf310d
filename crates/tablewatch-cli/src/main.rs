//! tablewatch binary.

use std::sync::Arc;

use clap::Parser;
use tablewatch_cli::{
    all_terminal, subscribe_listener, Args, InsertPrinter, ListenerConfig, DEFAULT_LOG_FILTER,
    FALLBACK_KEY_ENV,
};
use tablewatch_client::{ChangeHandler, Client};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Diagnostics go to stderr; stdout carries only inserted rows
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .init();

    let args = Args::parse();
    let config = ListenerConfig::from_args(&args, std::env::var(FALLBACK_KEY_ENV).ok())?;

    info!(
        url = %config.url,
        schema = %config.schema,
        table = %config.table,
        decode_payload = config.decode_payload,
        "Starting tablewatch"
    );

    let client = Client::new(config.client_config())?;
    let printer: Arc<dyn ChangeHandler> = Arc::new(InsertPrinter::stdout(config.decode_payload));
    let mut channels = subscribe_listener(&client, &config, printer)?;
    let watchers = channels.iter().map(|c| c.state_changes()).collect();

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupt received, shutting down");
        }
        states = all_terminal(watchers) => {
            client.shutdown().await;
            let reasons: Vec<String> = states.iter().map(|s| format!("{:?}", s)).collect();
            anyhow::bail!("no channel is listening: {}", reasons.join(", "));
        }
    }

    for channel in &mut channels {
        if let Err(e) = channel.unsubscribe().await {
            warn!(topic = %channel.topic(), error = %e, "Failed to leave channel");
        }
    }
    client.shutdown().await;

    Ok(())
}
