// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracing subscriber setup.
//!
//! Logs always go to stderr: stdout belongs to final responses and, in the
//! tool-server binary, to the wire protocol.

use std::io::{self, IsTerminal};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// How the global subscriber is built.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Level for foreman's own targets when RUST_LOG is unset.
    pub level: Level,

    /// Level for every other crate when RUST_LOG is unset.
    pub dependency_level: Level,

    /// Log span close events with their busy/idle time.
    pub span_timings: bool,

    /// Include file and line of each event.
    pub source_location: bool,

    /// Include the module path of each event.
    pub target: bool,

    /// `None` colors output only when stderr is a terminal.
    pub ansi: Option<bool>,

    pub compact: bool,

    /// Explicit filter directive. Wins over RUST_LOG.
    pub directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::cli()
    }
}

impl TelemetryConfig {
    /// Quiet terminal output for `foreman run`: warnings only.
    pub fn cli() -> Self {
        Self {
            level: Level::WARN,
            dependency_level: Level::WARN,
            span_timings: false,
            source_location: false,
            target: false,
            ansi: None,
            compact: true,
            directive: None,
        }
    }

    /// Lifecycle logging for `foreman serve`.
    pub fn server() -> Self {
        Self {
            level: Level::INFO,
            dependency_level: Level::WARN,
            target: true,
            ansi: Some(false),
            ..Self::cli()
        }
    }

    /// Everything foreman logs, with call span timings.
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            dependency_level: Level::INFO,
            span_timings: true,
            source_location: true,
            target: true,
            ansi: None,
            compact: false,
            directive: None,
        }
    }

    /// Trace-level output for tests.
    pub fn testing() -> Self {
        Self {
            level: Level::TRACE,
            ansi: Some(false),
            directive: Some("foreman=trace".to_string()),
            ..Self::verbose()
        }
    }

    /// Pick a preset from the CLI verbosity count (-v, -vv).
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => Self::cli(),
            1 => Self::cli().with_level(Level::INFO),
            _ => Self::verbose(),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = Some(ansi);
        self
    }

    /// Filter used when neither a directive nor RUST_LOG is given.
    pub fn default_directive(&self) -> String {
        format!(
            "{},foreman={},mock_tool_server={}",
            self.dependency_level.as_str().to_lowercase(),
            self.level.as_str().to_lowercase(),
            self.level.as_str().to_lowercase()
        )
    }

    fn filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_directive());
        match self.directive {
            Some(ref directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Returned by [`init_telemetry`]. Keep it alive for the program's duration.
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global tracing subscriber. Fails if one is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let span_events = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let ansi = config.ansi.unwrap_or_else(|| io::stderr().is_terminal());

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(ansi)
        .with_target(config.target)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(span_events);

    let registry = tracing_subscriber::registry().with(config.filter());
    let result = if config.compact {
        registry.with(fmt_layer.compact()).try_init()
    } else {
        registry.with(fmt_layer).try_init()
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}
