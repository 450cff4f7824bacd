use color_eyre::eyre::{eyre, Result};
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

/// Parses a level name such as `info` or `DEBUG`.
pub fn parse_level(level: &str) -> Result<Level> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|e| eyre!("Invalid log level '{}': {}", level, e))
}

/// Installs the global fmt subscriber. Returns `false` if a subscriber was
/// already installed, which is not an error.
pub fn init(level: &str) -> Result<bool> {
    let level = parse_level(level)?;
    let installed = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .is_ok();
    if !installed {
        debug!("Global tracing subscriber already set");
    }
    Ok(installed)
}
