use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use relay_core::config::Config;
use relay_core::domain::{DefaultMessage, Message, ProcessingError};
use relay_core::flow::FlowBuilder;
use relay_core::impls::InMemoryBroker;
use relay_core::EngineBuilder;

/// Used when no config file is given. The in-memory broker ignores the
/// connection settings, `connect_to` only has to be present.
const DEMO_CONFIG: &str = r#"
connection:
  connect_to: in-memory
processing:
  threads: 3
  max_retries: 2
routing:
  read_from: [greetings]
  write_to: greetings.done
  failure_policies:
    greetings: { dead_letter_wait_ms: 200 }
"#;

/// Run a demo flow on the in-memory broker.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Args {
    /// YAML config file; a built-in demo config is used without it.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Messages to send to the first input queue.
    #[arg(long, default_value_t = 10)]
    messages: usize,

    /// Make every k-th attempt fail (0 = never).
    #[arg(long, default_value_t = 0)]
    fail_every: u32,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_yaml(DEMO_CONFIG).context("demo config")?,
    };
    let input = config
        .routing
        .read_from
        .first()
        .cloned()
        .context("no input queue configured")?;
    let output = config.routing.write_to.clone();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let fail_every = args.fail_every;

    let flow = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
        .reader(|m: &DefaultMessage| {
            let greeting: Greeting = serde_json::from_value(m.payload().clone())?;
            Ok(greeting.name)
        })
        .transformer(move |name: String| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if fail_every > 0 && attempt % fail_every == 0 {
                return Err(ProcessingError::retry(format!(
                    "attempt {attempt} fails on purpose"
                )));
            }
            Ok(format!("Hello, {name}!"))
        })
        .writer(|text: String| {
            Ok(Some(
                DefaultMessage::generated().with_payload(serde_json::json!({ "text": text })),
            ))
        })
        .lock_key(|m| m.payload().get("name")?.as_str().map(str::to_string))
        .build();

    let broker = Arc::new(InMemoryBroker::new());
    let handle = EngineBuilder::from_config(&config)?
        .broker(broker.clone())
        .flow(flow)
        .build()?
        .start()
        .await?;

    for i in 0..args.messages {
        let message = DefaultMessage::generated()
            .with_tracing_id(i.to_string())
            .with_payload(serde_json::json!({ "name": format!("relay-{}", i % 3) }));
        broker.send(&input, serde_json::to_vec(&message)?);
    }

    let expected = args.messages;
    let finished = tokio::select! {
        done = broker.wait_for(Duration::from_secs(args.timeout_secs), |s| s.acked() >= expected) => done,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            false
        }
    };
    if !finished {
        tracing::warn!("not every message was settled");
    }

    let status = handle.status().await;
    let locks = Arc::clone(handle.lock_manager());
    handle.stop().await;

    let snapshot = broker.snapshot();
    let failed_route = config.failure_policy(&input).failed_routing_key;
    println!("attempts:      {}", attempts.load(Ordering::SeqCst));
    println!("acked:         {}", snapshot.acked());
    println!("dead-lettered: {}", snapshot.dead_lettered());
    if let Some(output) = &output {
        println!("published:     {}", snapshot.stored(output).len());
    }
    println!("failed:        {}", snapshot.stored(&failed_route).len());
    println!("status:        {}", serde_json::to_string(&status)?);
    println!(
        "locks:         {} acquired, waited {:?}, held {:?}",
        locks.locks_acquired(),
        locks.waited_for_locks(),
        locks.locks_held()
    );
    if let Some(output) = &output {
        for bytes in snapshot.stored(output).iter().take(3) {
            let message: DefaultMessage = serde_json::from_slice(bytes)?;
            println!(
                "  {} tracing_id={:?} {}",
                message.id(),
                message.tracing_id(),
                message.payload()
            );
        }
    }
    Ok(())
}
