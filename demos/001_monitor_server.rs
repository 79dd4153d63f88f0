//! Build monitor server.
//!
//! Demonstrates:
//! - Binding a MessageServer and hosting a service at the root path
//! - Registering typed request handlers
//! - Publishing periodic events to subscribed clients
//! - Watching connect/disconnect notifications
//!
//! Usage:
//!   cargo run --example 001_monitor_server
//!   cargo run --example 001_monitor_server -- --debug
//!
//! Pair it with `002_monitor_client` in a second terminal.

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::interval;

use common::Args;
use webmessage::{DEFAULT_PORT, MessageServer, MessageService, ServiceNotification};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct BuildProgress {
    progress: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BuildStatus {
    status: String,
    warnings: u32,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    common::init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    println!("=== 001: Monitor Server ===\n");

    // ========================================================================
    // Bind
    // ========================================================================

    println!("[1] Binding server...");

    let server = MessageServer::bind(DEFAULT_PORT)
        .await
        .with_context(|| format!("could not bind port {DEFAULT_PORT}; is another server running?"))?;
    println!("    ✓ Listening on {}\n", server.local_addr());

    // ========================================================================
    // Endpoints
    // ========================================================================

    println!("[2] Registering endpoints...");

    let (service, mut events) = MessageService::new();
    let progress = Arc::new(Mutex::new(0.0_f64));

    let state = progress.clone();
    service.register_handler("build/progress", move |_context, _query: Option<()>| {
        let state = state.clone();
        async move {
            Ok(BuildProgress {
                progress: *state.lock(),
            })
        }
    })?;

    let state = progress.clone();
    service.register_handler("build/status", move |_context, _query: Option<()>| {
        let state = state.clone();
        async move {
            let current = *state.lock();
            let status = if current >= 1.0 { "done" } else { "building" };
            Ok(BuildStatus {
                status: status.into(),
                warnings: (current * 10.0) as u32,
            })
        }
    })?;

    server.add_service("/", service.clone())?;
    println!("    ✓ build/progress");
    println!("    ✓ build/status\n");

    // ========================================================================
    // Background Work
    // ========================================================================

    println!("[3] Starting build loop (events every 2s)...\n");

    tokio::spawn(async move {
        while let Some(note) = events.recv().await {
            match note {
                ServiceNotification::ClientConnected { id } => {
                    println!("    [+] client connected ({id})");
                }
                ServiceNotification::ClientDisconnected { id } => {
                    println!("    [-] client disconnected ({id})");
                }
            }
        }
    });

    let ticker_service = service.clone();
    let ticker_state = progress.clone();
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(2));
        loop {
            tick.tick().await;
            let current = {
                let mut p = ticker_state.lock();
                *p = if *p >= 1.0 { 0.0 } else { *p + 0.05 };
                *p
            };
            match ticker_service
                .publish_event(&BuildProgress { progress: current })
                .await
            {
                Ok(true) => {}
                Ok(false) => println!("    [!] some subscribers missed the event"),
                Err(e) => println!("    [!] publish failed: {e}"),
            }
        }
    });

    common::wait_for_exit(args.no_wait).await;

    // ========================================================================
    // Cleanup
    // ========================================================================

    println!("\n[Cleanup] Shutting down...");
    server.shutdown();
    println!("          ✓ Done");

    Ok(())
}
