// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging Initialization
//!
//! Installs the process-wide `tracing` subscriber. Nothing here runs on its
//! own: the host application calls [`init_logging`] once at start-up. The
//! transport libraries are lowered to `warn` unless `RUST_LOG` says otherwise.

use crate::errors::AmqpError;
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

/// Log targets of the broker transport libraries
const NOISY_TARGETS: [&str; 4] = ["lapin", "amq_protocol", "amq_protocol_tcp", "pinky_swear"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured JSON, one object per line
    Json,
    /// Multi-line human-readable output
    Pretty,
    /// Single-line terminal output
    Compact,
}

impl LogFormat {
    /// Parses a format name, falling back to JSON.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Builds the filter for `level`, or from `RUST_LOG` when it is set.
pub fn build_filter(level: &str) -> Result<EnvFilter, AmqpError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::new(rust_log));
    }

    let mut filter = EnvFilter::new(level);
    for target in NOISY_TARGETS {
        let directive: Directive = format!("{target}=warn")
            .parse()
            .map_err(|err: tracing_subscriber::filter::ParseError| {
                AmqpError::ConfigError(err.to_string())
            })?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

/// Installs the global subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: &str, format: LogFormat) -> Result<(), AmqpError> {
    let subscriber = tracing_subscriber::registry().with(build_filter(level)?);

    let installed = match format {
        LogFormat::Json => subscriber.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => subscriber.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => subscriber
            .with(fmt::layer().compact().with_target(false))
            .try_init(),
    };

    installed.map_err(|err| AmqpError::ConfigError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Json);
    }

    #[test]
    fn filter_silences_transport_targets() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }

        let filter = build_filter("debug").unwrap().to_string();
        assert!(filter.contains("lapin=warn"));
        assert!(filter.contains("pinky_swear=warn"));
    }
}
