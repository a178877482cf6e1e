//! Two accounts talking over the in-memory network.
//!
//! ```bash
//! RUST_LOG=debug cargo run -p omemo-channel --bin omemo-loopback -- --config omemo.json
//! ```

use std::path::PathBuf;

use anyhow::Context as _;
use omemo_channel::{ChannelEvent, OmemoChannel, OmemoConfig};
use omemo_protocol::LoopbackNetwork;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

struct Args {
    config: Option<PathBuf>,
    store_dir: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut parsed = Args {
        config: None,
        store_dir: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => parsed.config = args.next().map(PathBuf::from),
            "--store-dir" => parsed.store_dir = args.next().map(PathBuf::from),
            _ => {}
        }
    }
    parsed
}

async fn next_message(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> anyhow::Result<String> {
    loop {
        match events.recv().await.context("channel closed")? {
            ChannelEvent::MessageReceived(message) => {
                return Ok(format!("{} [{:?}]: {}", message.from, message.security, message.body));
            }
            ChannelEvent::DecryptionFailed { from, reason, .. } => {
                tracing::warn!(from = %from, reason, "decryption failed");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();
    let mut config = match &args.config {
        Some(path) => OmemoConfig::load(path)?,
        None => OmemoConfig::default(),
    };
    if let Some(dir) = args.store_dir {
        config.store_dir = dir;
    }
    tracing::info!(store_dir = %config.store_dir.display(), "omemo-loopback starting");

    let network = LoopbackNetwork::new();
    let (alice_transport, alice_inbound) = network.connect("alice@example.org");
    let (bob_transport, bob_inbound) = network.connect("bob@example.org");

    let (alice, mut alice_events) =
        OmemoChannel::connect(config.clone(), "alice@example.org", alice_transport, alice_inbound)
            .await
            .context("connect alice")?;
    let (bob, mut bob_events) = OmemoChannel::connect(config, "bob@example.org", bob_transport, bob_inbound)
        .await
        .context("connect bob")?;

    if let (Some(a), Some(b)) = (alice.manager(), bob.manager()) {
        println!("alice device {} fingerprint {}", a.device_id(), a.fingerprint()?);
        println!("bob   device {} fingerprint {}", b.device_id(), b.fingerprint()?);
    }

    let sent = alice.send_direct("bob@example.org", "Hi Bob, this is encrypted.").await?;
    println!("alice -> bob (encrypted: {}, devices: {})", sent.encrypted, sent.devices);
    println!("{}", next_message(&mut bob_events).await?);

    let sent = bob.send_direct("alice@example.org", "Hi Alice, got it.").await?;
    println!("bob -> alice (encrypted: {}, devices: {})", sent.encrypted, sent.devices);
    println!("{}", next_message(&mut alice_events).await?);

    alice.disconnect().await;
    bob.disconnect().await;
    Ok(())
}
