//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use deerstream_core::config;

use crate::interrupt;

mod commands;

#[derive(Parser)]
#[command(name = "deerstream")]
#[command(version)]
#[command(about = "Terminal client for multi-agent research streams")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Service base URL (overrides config)
    #[arg(long, global = true, env = "DEERSTREAM_API_URL", value_name = "URL")]
    api_url: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

/// Recorded-log selection shared by commands that can replay.
#[derive(clap::Args, Debug, Clone, Default)]
struct ReplayArgs {
    /// Replay a recorded conversation by id
    #[arg(long, value_name = "ID", conflicts_with = "mock")]
    replay: Option<String>,

    /// Play scripted mock logs (optionally a named one)
    #[arg(long, value_name = "NAME", num_args = 0..=1, default_missing_value = "")]
    mock: Option<String>,

    /// Skip simulated delays when replaying
    #[arg(long)]
    fast_forward: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Chat with the research service (default)
    Chat {
        /// Send a single prompt and exit
        #[arg(short, long)]
        prompt: Option<String>,

        #[command(flatten)]
        replay: ReplayArgs,
    },

    /// Print the title of a recorded conversation
    ReplayTitle {
        #[command(flatten)]
        replay: ReplayArgs,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.quiet);
    interrupt::init()?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let mut config = config::Config::load().context("load config")?;
    if let Some(api_url) = cli.api_url {
        config.api_url = Some(api_url);
    }

    let Some(command) = cli.command else {
        return commands::chat::run(&config, None, &ReplayArgs::default()).await;
    };

    match command {
        Commands::Chat { prompt, replay } => {
            commands::chat::run(&config, prompt.as_deref(), &replay).await
        }
        Commands::ReplayTitle { replay } => commands::replay_title::run(&config, &replay).await,
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}

impl ReplayArgs {
    /// Location query selecting the recorded log, if any was requested.
    fn location_query(&self) -> Option<String> {
        if let Some(id) = &self.replay {
            return Some(format!("?replay={id}"));
        }
        match self.mock.as_deref() {
            Some("") => Some("?mock".to_string()),
            Some(name) => Some(format!("?mock={name}")),
            None => None,
        }
    }

    /// Applies the replay selection on top of the loaded config.
    fn apply(&self, config: &config::Config) -> config::Config {
        let mut config = config.clone();
        if let Some(query) = self.location_query() {
            config.replay.location_query = query;
        }
        config
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("deerstream={level},deerstream_core={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_args_location_query() {
        let args = ReplayArgs {
            replay: Some("eiffel".to_string()),
            ..ReplayArgs::default()
        };
        assert_eq!(args.location_query().as_deref(), Some("?replay=eiffel"));

        let args = ReplayArgs {
            mock: Some(String::new()),
            ..ReplayArgs::default()
        };
        assert_eq!(args.location_query().as_deref(), Some("?mock"));

        let args = ReplayArgs {
            mock: Some("deep-dive".to_string()),
            ..ReplayArgs::default()
        };
        assert_eq!(args.location_query().as_deref(), Some("?mock=deep-dive"));

        assert_eq!(ReplayArgs::default().location_query(), None);
    }

    #[test]
    fn test_replay_args_override_config_query() {
        let mut base = config::Config::default();
        base.replay.location_query = "?replay=from-config".to_string();

        assert_eq!(
            ReplayArgs::default().apply(&base).replay.location_query,
            "?replay=from-config"
        );

        let args = ReplayArgs {
            mock: Some(String::new()),
            ..ReplayArgs::default()
        };
        assert!(args.apply(&base).replay.enabled());
        assert_eq!(args.apply(&base).replay.location_query, "?mock");
    }

    #[test]
    fn test_cli_parses_mock_without_value() {
        let cli = Cli::try_parse_from(["deerstream", "chat", "--mock", "--fast-forward"]).unwrap();
        let Some(Commands::Chat { replay, prompt }) = cli.command else {
            panic!("expected chat command");
        };
        assert_eq!(replay.mock.as_deref(), Some(""));
        assert!(replay.fast_forward);
        assert_eq!(prompt, None);
    }

    #[test]
    fn test_replay_and_mock_conflict() {
        assert!(Cli::try_parse_from(["deerstream", "chat", "--replay", "a", "--mock"]).is_err());
    }
}
