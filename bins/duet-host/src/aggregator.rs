/// Result Aggregator - fan-in of the two sides of a run
///
/// **Core Responsibility:**
/// Wait for the container completion, the local completion and the deadline,
/// and fold them into one `Verdict`.
///
/// **Rules:**
/// - Both sides are drained before a run is called a success
/// - A container failure is the cause whenever one is observed
/// - A local failure is the cause if the container succeeds (or never exits)
/// - Deadline with no failure observed: `Timeout`
/// - Stragglers are not cancelled; their late results are dropped with the receivers
///
/// Knows nothing about Docker, the registry or the address exchange.

use duet_common::{ContainerExit, HarnessError, Outcome, Side, Verdict};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

/// Fold both observed outcomes into a verdict.
///
/// A container failure wins over a local failure regardless of which arrived first.
pub fn combine(container: Outcome, local: Outcome) -> Verdict {
    match (container, local) {
        (Outcome::Failed(e), _) => Verdict::Failed(e),
        (Outcome::Passed, Outcome::Failed(e)) => Verdict::Failed(e),
        (Outcome::Passed, Outcome::Passed) => Verdict::Passed,
    }
}

/// Block until both sides have reported or `deadline` passes.
pub async fn aggregate(
    mut container_rx: oneshot::Receiver<ContainerExit>,
    mut local_rx: oneshot::Receiver<Outcome>,
    deadline: Instant,
    run_timeout: Duration,
) -> Verdict {
    let mut container: Option<Outcome> = None;
    let mut local: Option<Outcome> = None;

    let timer = tokio::time::sleep_until(deadline);
    tokio::pin!(timer);

    while container.is_none() || local.is_none() {
        tokio::select! {
            biased;

            received = &mut container_rx, if container.is_none() => {
                let outcome = match received {
                    Ok(exit) => exit.outcome(),
                    Err(_) => Outcome::Failed(HarnessError::Container(
                        "container finished without reporting a result".to_string(),
                    )),
                };
                info!(passed = outcome.is_passed(), "Container finished");
                container = Some(outcome);
            }

            received = &mut local_rx, if local.is_none() => {
                let outcome = received.unwrap_or_else(|_| {
                    Outcome::Failed(HarnessError::Domain {
                        side: Side::Local,
                        message: "local action exited without reporting a result".to_string(),
                    })
                });
                info!(passed = outcome.is_passed(), "Local finished");
                if !outcome.is_passed() && container.is_none() {
                    info!("Local failed, still waiting for container to finish");
                }
                local = Some(outcome);
            }

            _ = &mut timer => {
                return on_deadline(container, local, run_timeout);
            }
        }
    }

    match (container, local) {
        (Some(c), Some(l)) => combine(c, l),
        // The loop only exits once both are set.
        _ => Verdict::Failed(HarnessError::timeout("waiting for results", run_timeout)),
    }
}

fn on_deadline(container: Option<Outcome>, local: Option<Outcome>, run_timeout: Duration) -> Verdict {
    let waiting_on = match (&container, &local) {
        (None, None) => "container and local",
        (None, Some(_)) => "container",
        _ => "local",
    };
    warn!(waiting_on, timeout_ms = run_timeout.as_millis() as u64, "Deadline reached");

    if let Some(Outcome::Failed(e)) = container {
        return Verdict::Failed(e);
    }
    if let Some(Outcome::Failed(e)) = local {
        return Verdict::Failed(e);
    }
    Verdict::Failed(HarnessError::timeout("waiting for results", run_timeout))
}
