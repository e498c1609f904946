/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! forgedns-transport - query one upstream DNS server from the command line
//!
//! Loads the transport configuration, starts every configured transport,
//! sends a single query through the selected one, prints the answer and
//! shuts everything down gracefully.

use forgedns_transport::config;
use forgedns_transport::core::error::{DnsError, Result};
use forgedns_transport::core::runtime::Runtime;
use forgedns_transport::core::init_log;
use forgedns_transport::network::upstream::StartStage;
use forgedns_transport::network::upstream::manager::TransportManager;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use std::str::FromStr;
use tokio::{runtime, signal};
use tracing::{error, info};

/// Application entry point
fn main() -> Result<()> {
    init_runtime()
}

/// Initialize and run the Tokio runtime
fn init_runtime() -> Result<()> {
    let mut tokio_runtime = runtime::Builder::new_multi_thread();
    tokio_runtime
        .enable_all()
        .thread_name("forgedns-worker")
        .worker_threads(2);
    let tokio_runtime = tokio_runtime
        .build()
        .map_err(|err| DnsError::runtime(format!("Failed to initialize Tokio runtime: {err}")))?;
    tokio_runtime.block_on(run_async_main())
}

async fn run_async_main() -> Result<()> {
    let mut runtime = Runtime::init();
    let options = runtime.options.clone();

    let config = match config::init(&options.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration initialization failed: {e}");
            std::process::exit(1);
        }
    };

    let mut log_config = config.log.clone();
    if let Some(level) = options.log_level {
        log_config.level = level;
    }
    runtime.log_guard = Some(init_log(log_config));

    let request = build_query(&options.name, &options.qtype)?;

    let manager = TransportManager::new(&config.transports)?;
    for stage in StartStage::ALL {
        manager.start(stage)?;
    }

    let transport = match options.server.as_deref() {
        Some(tag) => manager
            .get(tag)
            .ok_or_else(|| DnsError::config(format!("unknown transport tag: {tag}")))?,
        None => manager.default(),
    };
    info!(
        tag = %transport.tag(),
        kind = %transport.transport_type(),
        name = %options.name,
        qtype = %options.qtype,
        "Sending query"
    );

    let outcome = tokio::select! {
        res = transport.exchange(&request) => Some(res),
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C signal, initiating graceful shutdown");
            None
        }
    };

    match outcome {
        Some(Ok(response)) => println!("{response}"),
        Some(Err(e)) => error!(tag = %transport.tag(), err = %e, "Query failed"),
        None => {}
    }

    manager.close().await?;
    info!("Graceful shutdown complete");
    Ok(())
}

fn build_query(name: &str, qtype: &str) -> Result<Message> {
    let name = Name::from_str(name)
        .map_err(|e| DnsError::config(format!("invalid query name {name}: {e}")))?;
    let qtype = RecordType::from_str(&qtype.to_uppercase())
        .map_err(|e| DnsError::config(format!("invalid query type {qtype}: {e}")))?;

    let mut request = Message::new();
    request.set_id(rand::random());
    request.set_recursion_desired(true);
    request.add_query(Query::query(name, qtype));
    Ok(request)
}
