use anyhow::Result;
use realtime_sdk::bin_common::{
    init_logging_with_level, load_options, parse_args, print_banner, print_shutdown, ConfigType,
    RunConfig,
};
use realtime_sdk::realtime_core::RealtimeClientBuilder;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load config first (before logging is initialized)
    let options = load_options(ConfigType::Client)?;
    init_logging_with_level(&options.log_level);

    let channels = parse_args();
    if channels.is_empty() {
        anyhow::bail!("usage: realtime_tail <channel> [<channel>...]");
    }

    let run = RunConfig::new("Realtime tail");
    print_banner(&run);

    let client = RealtimeClientBuilder::from_options(options)?
        .name("realtime_tail")
        .build()?;

    let mut states = client.connection().on_state_change();
    tokio::spawn(async move {
        while let Some(change) = states.recv().await {
            match (&change.reason, change.retry_in) {
                (Some(reason), Some(retry_in)) => {
                    warn!("Connection {} ({}), retrying in {:?}", change.current, reason, retry_in)
                }
                (Some(reason), None) => warn!("Connection {} ({})", change.current, reason),
                (None, _) => info!("Connection {}", change.current),
            }
        }
    });

    for name in &channels {
        let channel = client.channel(name);
        let mut messages = channel.subscribe();
        let channel_name = name.clone();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                match serde_json::to_string(&message) {
                    Ok(json) => println!("{} {}", channel_name, json),
                    Err(e) => error!("Failed to render message on {}: {}", channel_name, e),
                }
            }
        });

        // Attach waits for the connection; keep the other channels moving
        tokio::spawn(async move {
            match channel.attach().await {
                Ok(()) => info!("Attached to {}", channel.name()),
                Err(e) => error!("Failed to attach to {}: {}", channel.name(), e),
            }
        });
    }

    let mut stats = tokio::time::interval(Duration::from_secs(run.stats_interval_secs));
    stats.tick().await;
    loop {
        tokio::select! {
            _ = stats.tick() => {
                let metrics = client.metrics().await;
                info!(
                    "Stats: {} received, {} sent, {} reconnects ({})",
                    metrics.messages_received,
                    metrics.messages_sent,
                    metrics.reconnect_count,
                    metrics.connection_state
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let metrics = client.metrics().await;
    client.shutdown().await?;
    print_shutdown(
        &run,
        Some(&format!("Received {} messages", metrics.messages_received)),
    );
    Ok(())
}
