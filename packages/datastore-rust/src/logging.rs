//! Tracing subscriber setup for datastore binaries.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Builds the filter: `RUST_LOG` if set, else `default_directive`.
#[must_use]
pub fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(default_directive: &str, format: LogFormat) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(default_directive))
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_applies_without_env() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(filter("warn").to_string(), "warn");
        }
    }

    #[test]
    fn second_init_fails_instead_of_panicking() {
        let _ = init("error", LogFormat::Pretty);
        assert!(init("error", LogFormat::Json).is_err());
    }
}
