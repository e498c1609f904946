/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Core runtime pieces shared by every transport: errors, logging, the
//! command-line runtime and the one-shot signal primitive.

use crate::config::types::LogConfig;
use crate::core::log::TransportLogFormatter;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub mod error;
mod log;
pub mod runtime;
pub mod signal;

/// Initialize logging
///
/// Installs a console layer and, when `log.file` is set, a non-blocking file
/// layer. The returned guard must be held until shutdown so buffered lines
/// are flushed.
pub fn init_log(log: LogConfig) -> WorkerGuard {
    let file_target = log.file.as_deref().map(Path::new).and_then(|path| {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty())?;
        let name = path.file_name()?;
        Some((dir.to_path_buf(), name.to_os_string()))
    });

    let (file_writer, guard) = match file_target {
        Some((dir, name)) => {
            let file_appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (Some(non_blocking), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = fmt::layer()
        .event_format(TransportLogFormatter)
        .with_writer(std::io::stdout);

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .event_format(TransportLogFormatter)
            .with_writer(writer)
    });

    let mut filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| EnvFilter::new("info"));

    // quinn and rustls are chatty at debug level
    for directive in ["quinn=warn", "quinn_proto=warn", "rustls=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = Registry::default().with(filter).with(console_layer);

    if let Some(file_layer) = file_layer {
        subscriber.with(file_layer).init();
    } else {
        subscriber.init();
    };

    guard.unwrap_or_else(|| tracing_appender::non_blocking(std::io::sink()).1)
}
