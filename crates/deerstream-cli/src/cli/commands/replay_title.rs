//! Replay title command handler.

use anyhow::{Context, Result, bail};
use deerstream_core::config::Config;
use deerstream_core::store::UNTITLED_RESEARCH;
use deerstream_core::transport::ReplayTransport;

use crate::cli::ReplayArgs;

pub async fn run(config: &Config, replay: &ReplayArgs) -> Result<()> {
    let config = replay.apply(config);
    if !config.replay.enabled() {
        bail!("No replay selected. Pass --replay ID or set replay.location_query in config.");
    }

    let transport = ReplayTransport::from_config(&config.replay);
    transport.fast_forward().set(replay.fast_forward);
    let title = transport
        .fetch_replay_title()
        .await
        .context("fetch replay title")?;
    println!("{}", title.as_deref().unwrap_or(UNTITLED_RESEARCH));
    Ok(())
}
