// Logging bootstrap for the `act` binary: a tracing-subscriber fmt layer
// filtered by `RUST_LOG`, with an optional JSON formatter.

use anyhow::{anyhow, Result};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogSettings {
    /// Lower the default level from info to debug.
    pub verbose: bool,
    /// Emit one JSON object per event.
    pub json: bool,
}

impl LogSettings {
    pub fn default_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    fn env_filter(&self) -> EnvFilter {
        self.filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
    }

    /// `directives` in `RUST_LOG` syntax; the default level applies only
    /// when they name none.
    fn filter_from(&self, directives: Option<&str>) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.default_level()).into())
            .parse_lossy(directives.unwrap_or_default())
    }
}

/// Install the global subscriber. Fails when one is already installed.
pub fn init(settings: LogSettings) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(settings.env_filter())
        .with_target(true);

    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| anyhow!("Failed to initialise logging: {e}"))
}
