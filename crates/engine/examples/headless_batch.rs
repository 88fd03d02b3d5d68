// Headless batch runner
//
// Simulates a batch of identities sending a handful of messages each, with
// staggered launch, per-action pacing and occasional rate limiting.
//
// Run with: cargo run -p fleetrun-engine --example headless_batch
//
// Configuration comes from the environment (or a .env file):
//   FLEETRUN_LAUNCH_DELAY_MIN / FLEETRUN_LAUNCH_DELAY_MAX
//   FLEETRUN_ACTION_DELAY_MIN / FLEETRUN_ACTION_DELAY_MAX
//   FLEETRUN_RATE_LIMIT_THRESHOLD, FLEETRUN_STOP_ON_EMERGENCY
//   RUST_LOG, LOG_FORMAT

use std::time::Duration;

use fleetrun_engine::prelude::*;
use fleetrun_engine::telemetry::{init_telemetry, TelemetryConfig};
use rand::Rng;

const MESSAGES_PER_IDENTITY: u8 = 4;

/// Pretends to send messages, failing now and then the way a remote service would
struct SendMessages {
    recipients: Vec<String>,
}

impl SendMessages {
    fn new(identity: &str) -> Self {
        Self {
            recipients: (1..=MESSAGES_PER_IDENTITY)
                .map(|i| format!("{identity}-contact-{i}"))
                .collect(),
        }
    }
}

async fn send(recipient: &str) -> Result<(), JobError> {
    tokio::time::sleep(Duration::from_millis(200)).await;
    match rand::thread_rng().gen_range(0..10) {
        0 => Err(JobError::remote("A wait of 3 seconds is required")),
        1 => Err(JobError::transport(format!("connection reset sending to {recipient}"))),
        _ => Ok(()),
    }
}

#[async_trait(?Send)]
impl Job for SendMessages {
    async fn run(&mut self, ctx: &WorkerContext) -> Result<(), JobError> {
        let total = self.recipients.len();
        let mut sent = 0;

        while sent < total {
            ctx.check_cancelled()?;
            let recipient = &self.recipients[sent];

            if let Err(err) = send(recipient).await {
                match ctx.handle_failure(&err) {
                    FailureAction::RetryAfter(wait) => {
                        ctx.sleep(wait).await?;
                        continue;
                    }
                    FailureAction::Abort => return Err(err),
                    FailureAction::Ignore => {}
                }
            } else {
                ctx.log(format!("Sent to {recipient}"));
            }

            sent += 1;
            ctx.progress((sent * 100 / total) as u8, recipient.clone());
            if sent < total {
                ctx.apply_delay().await?;
            }
        }
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry(TelemetryConfig::from_env());

    let config = EngineConfig::from_env()?;
    let mut batch = Batch::new(config)?;
    batch.reset_rate_limits();

    let workers: Vec<_> = (1..=5)
        .map(|i| {
            let identity = format!("session-{i}");
            let job = SendMessages::new(&identity);
            batch.worker(identity, job)
        })
        .collect();
    batch.launch_staggered(workers);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut stopping = false;

    loop {
        tokio::select! {
            event = batch.next_event() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            _ = &mut shutdown, if !stopping => {
                eprintln!("Stopping batch...");
                stopping = true;
                batch.stop();
            }
        }
    }

    let completed = batch.engine().completed();
    eprintln!(
        "Batch done: {} workers, {} rate-limit hits, emergency: {}",
        completed.len(),
        batch.policy().total_hits(),
        batch.is_emergency()
    );
    Ok(())
}
