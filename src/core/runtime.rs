/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Runtime configuration and command-line argument parsing

use clap::Parser;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;

/// Core runtime container holding parsed command-line options
pub struct Runtime {
    pub options: Options,
    /// Log worker guard to ensure logs are flushed on shutdown
    pub log_guard: Option<WorkerGuard>,
}

impl Runtime {
    pub fn init() -> Self {
        Runtime {
            options: Options::parse(),
            log_guard: None,
        }
    }
}

/// Command-line options
///
/// Sends one query through a configured transport and prints the answer.
#[derive(Parser, Clone, Debug)]
#[clap(version = "1.0", author = "Sven Shi <isvenshi@gmail.com>")]
pub struct Options {
    /// Path to configuration file
    #[clap(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Log level (overrides config file): off, trace, debug, info, warn, error
    #[clap(short, long)]
    pub log_level: Option<String>,

    /// Transport tag to query (defaults to the first configured transport)
    #[clap(short, long)]
    pub server: Option<String>,

    /// Query type, e.g. A, AAAA, MX, TXT
    #[clap(short = 't', long, default_value = "A")]
    pub qtype: String,

    /// Domain name to resolve
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let options = Options::parse_from([
            "forgedns-transport",
            "-c",
            "dns.yaml",
            "--server",
            "doh",
            "-t",
            "AAAA",
            "example.com",
        ]);
        assert_eq!(options.config, PathBuf::from("dns.yaml"));
        assert_eq!(options.server.as_deref(), Some("doh"));
        assert_eq!(options.qtype, "AAAA");
        assert_eq!(options.name, "example.com");
        assert!(options.log_level.is_none());
    }
}
