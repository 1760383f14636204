use anyhow::{Context, bail};
use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use peercall::calls::media::loopback::{DeviceBehavior, LoopbackDevices, LoopbackPeerFactory};
use peercall::calls::{CallConfig, CallSessionController, CallState, MediaBackend};
use peercall::signaling::LoopbackHub;
use std::sync::Arc;
use std::time::Duration;

// Two users calling each other over an in-process relay.
//
// Usage:
//   cargo run --bin loopback_call                    # alice calls bob, bob answers
//   cargo run --bin loopback_call -- --reject        # bob declines
//   cargo run --bin loopback_call -- --deny-media    # bob's camera prompt is denied

/// Slack on top of the ring timeout for negotiation to finish.
const NEGOTIATION_GRACE_SECS: u64 = 5;

#[derive(Parser, Debug)]
#[command(about = "Place a call between two in-process users")]
struct Args {
    /// Seconds the caller rings before giving up.
    #[arg(long, default_value_t = 10)]
    ring_timeout_secs: u64,

    /// How long the call stays up before the caller hangs up.
    #[arg(long, default_value_t = 500)]
    talk_ms: u64,

    /// Callee declines instead of answering.
    #[arg(long)]
    reject: bool,

    /// Callee denies camera and microphone access.
    #[arg(long)]
    deny_media: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();
    let config = CallConfig::default().with_ring_timeout_secs(args.ring_timeout_secs);

    let hub = LoopbackHub::new();
    let alice = CallSessionController::new(
        "alice",
        hub.connect("alice"),
        MediaBackend::loopback(),
        config.clone(),
    );

    let bob_devices = if args.deny_media {
        LoopbackDevices::with_behavior(DeviceBehavior::Deny)
    } else {
        LoopbackDevices::new()
    };
    let bob = Arc::new(CallSessionController::new(
        "bob",
        hub.connect("bob"),
        MediaBackend::new(Arc::new(bob_devices), Arc::new(LoopbackPeerFactory::new())),
        config,
    ));

    let answering = bob.clone();
    let mut ringing = bob.events().state.subscribe();
    let reject = args.reject;
    let callee = tokio::spawn(async move {
        while let Ok(change) = ringing.recv().await {
            if change.state != CallState::RingingIn {
                continue;
            }
            let result = if reject {
                answering.reject_call().await
            } else {
                answering.accept_call().await
            };
            if let Err(e) = result {
                warn!("bob could not answer: {e}");
            }
        }
    });

    let _remote = alice.on_remote_stream(|ready| {
        info!(
            "alice sees bob's stream {} ({} tracks)",
            ready.stream.id(),
            ready.stream.tracks().len()
        );
    });

    let mut states = alice.events().state.subscribe();
    let mut summaries = alice.events().call_ended.subscribe();
    let call_id = alice.initiate_call("bob").await?;
    info!("alice placed call {call_id}");

    let wait = Duration::from_secs(args.ring_timeout_secs + NEGOTIATION_GRACE_SECS);
    let outcome = tokio::time::timeout(wait, async {
        while let Ok(change) = states.recv().await {
            if matches!(change.state, CallState::Active | CallState::Ended) {
                return Some(change);
            }
        }
        None
    })
    .await
    .context("call neither connected nor ended in time")?;

    match outcome {
        Some(change) if change.state == CallState::Active => {
            info!("call {call_id} is active, talking for {}ms", args.talk_ms);
            tokio::time::sleep(Duration::from_millis(args.talk_ms)).await;
            alice.hangup().await?;
        }
        Some(change) => {
            info!(
                "call {call_id} ended before connecting: {}{}",
                change.reason.map_or("unknown".to_string(), |r| r.to_string()),
                change
                    .error
                    .as_deref()
                    .map_or(String::new(), |e| format!(" ({e})"))
            );
        }
        None => bail!("alice's event bus closed"),
    }

    let summary = summaries.recv().await?;
    println!("{}", serde_json::to_string_pretty(summary.as_ref())?);

    alice.shutdown().await;
    bob.shutdown().await;
    callee.abort();
    Ok(())
}
