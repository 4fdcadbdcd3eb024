/// Orchestrator - runs one two-sided test end to end
///
/// **Flow:**
/// 1. Look the test up in the registry (unknown name: nothing is started)
/// 2. Start the container and a task waiting for it to exit
/// 3. Discover the container's address
/// 4. Send it our address through the exchange port
/// 5. Start the local action on its own task
/// 6. Hand both completions and the deadline to the aggregator
///
/// The container is cleaned up on every path out of `run`.

use crate::aggregator::aggregate;
use crate::diagnostics::Diagnostics;
use crate::runner::{ContainerGuard, ContainerRunner, ContainerSpec};
use duet_common::clock::{Clock, TokioClock};
use duet_common::config::HarnessConfig;
use duet_common::exchange::{announce_address, discover_own_address};
use duet_common::{HarnessError, Outcome, Registry, Side, Verdict};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Starting,
    HandshakeListening,
    HandshakeAnnouncing,
    Running,
    Aggregating,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Initializing => "initializing",
            Phase::Starting => "starting",
            Phase::HandshakeListening => "handshake_listening",
            Phase::HandshakeAnnouncing => "handshake_announcing",
            Phase::Running => "running",
            Phase::Aggregating => "aggregating",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

pub struct Orchestrator<C: Clock = TokioClock> {
    registry: Registry,
    runner: Box<dyn ContainerRunner>,
    clock: C,
    config: HarnessConfig,
    diagnostics: Diagnostics,
}

impl Orchestrator<TokioClock> {
    pub fn new(registry: Registry, runner: Box<dyn ContainerRunner>, config: HarnessConfig) -> Self {
        Self::with_clock(registry, runner, config, TokioClock)
    }
}

impl<C: Clock> Orchestrator<C> {
    pub fn with_clock(
        registry: Registry,
        runner: Box<dyn ContainerRunner>,
        config: HarnessConfig,
        clock: C,
    ) -> Self {
        let diagnostics = Diagnostics::new(config.artifacts_dir.clone());
        Self {
            registry,
            runner,
            clock,
            config,
            diagnostics,
        }
    }

    /// Run one test and return its verdict. Never returns before the
    /// container has been cleaned up.
    #[instrument(skip(self, name), fields(test = %name))]
    pub async fn run(&self, name: &str) -> Verdict {
        let start = std::time::Instant::now();
        enter(Phase::Initializing);

        let verdict = match self.run_phases(name).await {
            Ok(verdict) => verdict,
            Err(e) => Verdict::Failed(e),
        };

        enter(Phase::Done);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match verdict.cause() {
            None => info!(elapsed_ms, "Test passed"),
            Some(cause) => error!(elapsed_ms, kind = cause.kind(), error = %cause, "Test failed"),
        }
        verdict
    }

    /// Run several tests one after another.
    pub async fn run_all(&self, names: &[&str]) -> Vec<(String, Verdict)> {
        let mut verdicts = Vec::with_capacity(names.len());
        for name in names {
            let verdict = self.run(name).await;
            verdicts.push((name.to_string(), verdict));
        }
        verdicts
    }

    async fn run_phases(&self, name: &str) -> Result<Verdict, HarnessError> {
        let test = self.registry.lookup(name)?;

        enter(Phase::Starting);
        let spec = ContainerSpec::for_test(&self.config, name);
        let handle = self.runner.start(&spec).await?;
        let guard = ContainerGuard::new(handle.clone());

        let (container_tx, container_rx) = oneshot::channel();
        let waiter = {
            let handle = handle.clone();
            let diagnostics = self.diagnostics.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                let exit = handle.wait().await;
                diagnostics.record(&name, &exit).await;
                // The receiver is gone if we already gave up on this run.
                let _ = container_tx.send(exit);
            })
        };

        enter(Phase::HandshakeListening);
        let container_ip =
            match discover_own_address(&self.clock, &*handle, self.config.poll_policy()).await {
                Ok(ip) => ip,
                Err(e) => {
                    self.abandon(guard, waiter).await;
                    return Err(e);
                }
            };

        enter(Phase::HandshakeAnnouncing);
        if let Err(e) = announce_address(
            &self.clock,
            container_ip,
            self.config.exchange_port,
            self.config.dial_policy(),
        )
        .await
        {
            self.abandon(guard, waiter).await;
            return Err(e);
        }

        enter(Phase::Running);
        let (local_tx, local_rx) = oneshot::channel();
        let local_test = Arc::clone(&test);
        tokio::spawn(async move {
            let outcome = match local_test.local_action(container_ip).await {
                Ok(()) => Outcome::Passed,
                Err(e) => Outcome::Failed(HarnessError::domain(Side::Local, &e)),
            };
            let _ = local_tx.send(outcome);
        });

        enter(Phase::Aggregating);
        let run_timeout = self.config.run_timeout();
        let verdict = aggregate(container_rx, local_rx, Instant::now() + run_timeout, run_timeout).await;

        guard.release().await;
        Ok(verdict)
    }

    /// Handshake failed: tear the container down and give its wait task a
    /// bounded chance to finish so its output still gets recorded.
    async fn abandon(&self, guard: ContainerGuard, waiter: JoinHandle<()>) {
        guard.release().await;
        let run_timeout = self.config.run_timeout();
        if tokio::time::timeout(run_timeout, waiter).await.is_err() {
            warn!(timeout_ms = run_timeout.as_millis() as u64, "Container did not exit after cleanup");
        }
    }
}

fn enter(phase: Phase) {
    info!(phase = %phase, "Phase transition");
}
