//! Build monitor client.
//!
//! Demonstrates:
//! - Attaching to a device and pairing
//! - Typed request/response calls
//! - Subscribing to an endpoint's events
//! - Watching connection notifications
//!
//! Usage:
//!   cargo run --example 002_monitor_client
//!   cargo run --example 002_monitor_client -- --debug
//!
//! Start `001_monitor_server` first; this connects to 127.0.0.1.

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use common::Args;
use webmessage::{ClientNotification, DEFAULT_PORT, Device, MessageClient};

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
    println!("=== 002: Monitor Client ===\n");

    // ========================================================================
    // Attach & Pair
    // ========================================================================

    println!("[1] Connecting to 127.0.0.1:{DEFAULT_PORT}...");

    let (client, mut notifications) = MessageClient::new();

    tokio::spawn(async move {
        while let Some(note) = notifications.recv().await {
            match note {
                ClientNotification::ConnectionChanged { device, connected } => {
                    let state = if connected { "up" } else { "down" };
                    println!("    [~] {} is {state}", device.address());
                }
                ClientNotification::PairingUpdated { key_changed, .. } => {
                    println!("    [~] pairing key updated (changed: {key_changed})");
                }
                ClientNotification::InvalidMessage { raw } => {
                    println!("    [!] unreadable frame: {raw}");
                }
            }
        }
    });

    client
        .attach(Device::new("127.0.0.1", DEFAULT_PORT))
        .await
        .context("could not reach the server; is 001_monitor_server running?")?;
    client.connect().await.context("pairing handshake failed")?;

    println!("    ✓ Connected (paired: {})", client.is_paired());
    if let Some(device) = client.device() {
        println!("    Key: {}\n", device.pairing_key);
    }

    // ========================================================================
    // Call
    // ========================================================================

    println!("[2] Calling build/status...");

    let status: BuildStatus = client.call("build/status", &()).await?;
    println!(
        "    ✓ Status: {} ({} warnings)\n",
        status.status, status.warnings
    );

    // ========================================================================
    // Subscribe
    // ========================================================================

    println!("[3] Subscribing to build/progress...");
    println!("    Events arrive every ~2 seconds...");

    let event_count = Arc::new(AtomicUsize::new(0));
    let event_count_clone = Arc::clone(&event_count);

    client
        .subscribe("build/progress", &(), move |event: BuildProgress| {
            let count = event_count_clone.fetch_add(1, Ordering::SeqCst) + 1;
            println!("    → Event #{count}: build at {:.0}%", event.progress * 100.0);
        })
        .await?;

    println!("    ✓ Subscribed, watching for 7s...");
    sleep(Duration::from_secs(7)).await;

    client.unsubscribe("build/progress").await?;
    let final_count = event_count.load(Ordering::SeqCst);
    println!("    ✓ Unsubscribed after {final_count} event(s)\n");

    common::wait_for_exit(args.no_wait).await;

    // ========================================================================
    // Cleanup
    // ========================================================================

    println!("\n[Cleanup] Closing client...");
    client.close();
    println!("          ✓ Done");

    Ok(())
}
