use anyhow::{Context, Result};
use realtime_sdk::bin_common::{init_logging_with_level, load_options, parse_args, ConfigType};
use realtime_sdk::realtime_core::{ConnectionState, RealtimeClientBuilder};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let options = load_options(ConfigType::Client)?;
    init_logging_with_level(&options.log_level);

    let args = parse_args();
    let [channel, name, data] = args.as_slice() else {
        anyhow::bail!("usage: realtime_publish <channel> <name> <data>");
    };
    // JSON when it parses, a plain string otherwise
    let data = serde_json::from_str::<Value>(data).unwrap_or_else(|_| Value::String(data.clone()));

    let client = RealtimeClientBuilder::from_options(options)?
        .name("realtime_publish")
        .build()?;

    let channel = client.channel(channel);
    tokio::time::timeout(PUBLISH_TIMEOUT, channel.publish(name.clone(), data))
        .await
        .context("timed out waiting for acknowledgement")??;
    info!("Published {} to {}", name, channel.name());

    client.close()?;
    tokio::time::timeout(
        PUBLISH_TIMEOUT,
        client.connection().when_state(ConnectionState::Closed),
    )
    .await
    .context("timed out closing the connection")??;
    client.shutdown().await?;
    Ok(())
}
