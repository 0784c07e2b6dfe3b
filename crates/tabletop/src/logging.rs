#![forbid(unsafe_code)]

//! Subscriber setup for binaries and demos.
//!
//! Libraries in this workspace only emit `tracing` events under the
//! `tabletop.*` targets; installing a subscriber is left to the embedding
//! program. [`init`] is the standard one: an [`EnvFilter`] read from
//! `TABLETOP_LOG` (falling back to the given directive) in front of a
//! human-readable or JSON formatter.
//!
//! ```text
//! TABLETOP_LOG=tabletop.replication=trace,tabletop=info
//! ```

use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding filter directives.
pub const ENV_VAR: &str = "TABLETOP_LOG";

/// Output format of [`init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Errors from [`init`].
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log directive: {0}")]
    Directive(#[from] ParseError),
    /// A global subscriber is already installed.
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Build the filter: directives from [`ENV_VAR`] when set, else `default_directive`.
pub fn filter(default_directive: &str) -> Result<EnvFilter, LoggingError> {
    let directive = default_directive.parse()?;
    Ok(EnvFilter::builder()
        .with_default_directive(directive)
        .with_env_var(ENV_VAR)
        .from_env_lossy())
}

/// Install the global subscriber.
pub fn init(default_directive: &str, format: LogFormat) -> Result<(), LoggingError> {
    let filter = filter(default_directive)?;
    let (pretty, json) = match format {
        LogFormat::Pretty => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_current_span(true))),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_default_directive_is_rejected() {
        assert!(matches!(
            filter("tabletop=loud"),
            Err(LoggingError::Directive(_))
        ));
    }

    #[test]
    fn second_init_reports_already_initialized() {
        init("tabletop=debug", LogFormat::Json).expect("first init");
        assert!(matches!(
            init("info", LogFormat::Pretty),
            Err(LoggingError::AlreadyInitialized(_))
        ));
    }
}
