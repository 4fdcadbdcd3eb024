/// Container Runner - Abstraction over the isolated environment
///
/// **Core Responsibility:**
/// Start the container side of a test, report its address, wait for it to
/// exit and tear it down.
///
/// **Boundary:**
/// - Runner knows HOW the environment is launched (Docker, in-process)
/// - Runner does NOT know about the address exchange or verdicts
/// - `cleanup` must be idempotent; the orchestrator always calls it
///
/// Production uses `DockerRunner` (docker.rs). `InProcessRunner` runs the
/// container action on a local task over loopback, which is enough for tests
/// that don't need packet filtering privileges.

use async_trait::async_trait;
use duet_common::config::HarnessConfig;
use duet_common::exchange::{learn_peer_address, AddressSource};
use duet_common::{ContainerExit, HarnessError, Registry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// What to launch for one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub test_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub capabilities: Vec<String>,
}

impl ContainerSpec {
    pub fn for_test(config: &HarnessConfig, test_name: &str) -> Self {
        Self {
            test_name: test_name.to_string(),
            image: config.image.clone(),
            command: vec![
                config.runner_binary.clone(),
                "--name".to_string(),
                test_name.to_string(),
                "--port".to_string(),
                config.exchange_port.to_string(),
            ],
            capabilities: config.capabilities.clone(),
        }
    }
}

/// A started environment. All methods take `&self` so the wait task and the
/// orchestrator can share one handle.
#[async_trait]
pub trait ContainerHandle: AddressSource {
    fn id(&self) -> &str;

    /// Block until the environment exits; returns combined output and error.
    async fn wait(&self) -> ContainerExit;

    /// Tear the environment down. Safe to call more than once.
    async fn cleanup(&self);
}

#[async_trait]
pub trait ContainerRunner: Send + Sync {
    async fn start(&self, spec: &ContainerSpec) -> Result<Arc<dyn ContainerHandle>, HarnessError>;
}

/// Container cleanup guard - cleanup runs even if the run is cancelled
/// or panics before `release` is reached.
pub struct ContainerGuard {
    handle: Arc<dyn ContainerHandle>,
    armed: bool,
}

impl ContainerGuard {
    pub fn new(handle: Arc<dyn ContainerHandle>) -> Self {
        Self { handle, armed: true }
    }

    pub async fn release(mut self) {
        self.armed = false;
        self.handle.cleanup().await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cannot be async in Drop
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    handle.cleanup().await;
                });
            }
            Err(_) => warn!(container = handle.id(), "No runtime left to clean up container"),
        }
    }
}

/// Runs the container half of registered tests on a local task.
/// The "container" address is always the loopback address.
pub struct InProcessRunner {
    registry: Registry,
    exchange_port: u16,
    exchange_timeout: Duration,
}

impl InProcessRunner {
    pub fn new(registry: Registry, config: &HarnessConfig) -> Self {
        Self {
            registry,
            exchange_port: config.exchange_port,
            exchange_timeout: config.exchange_timeout(),
        }
    }
}

#[async_trait]
impl ContainerRunner for InProcessRunner {
    async fn start(&self, spec: &ContainerSpec) -> Result<Arc<dyn ContainerHandle>, HarnessError> {
        let test = self.registry.lookup(&spec.test_name)?;
        let port = self.exchange_port;
        let timeout = self.exchange_timeout;
        let (exit_tx, exit_rx) = watch::channel(None);

        let task = tokio::spawn(async move {
            let mut output = format!("Running test {:?}\n", test.name());
            let exit = match learn_peer_address(port, timeout).await {
                Err(e) => ContainerExit::failure(output, e.to_string()),
                Ok(peer) => {
                    output.push_str(&format!("Connected to {}\n", peer));
                    match test.container_action(peer).await {
                        Ok(()) => ContainerExit::success(output),
                        Err(e) => ContainerExit::failure(
                            output,
                            format!("Failed running test {:?}: {:#}", test.name(), e),
                        ),
                    }
                }
            };
            let _ = exit_tx.send(Some(exit));
        });

        let id = format!("in-process-{}", uuid::Uuid::new_v4());
        info!(container = %id, test = %spec.test_name, "Started in-process container");

        Ok(Arc::new(InProcessHandle {
            id,
            exit: exit_rx,
            abort: task.abort_handle(),
            cleaned: AtomicBool::new(false),
        }))
    }
}

struct InProcessHandle {
    id: String,
    exit: watch::Receiver<Option<ContainerExit>>,
    abort: AbortHandle,
    cleaned: AtomicBool,
}

#[async_trait]
impl AddressSource for InProcessHandle {
    async fn find_address(&self) -> anyhow::Result<Option<String>> {
        Ok(Some("127.0.0.1".to_string()))
    }
}

#[async_trait]
impl ContainerHandle for InProcessHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&self) -> ContainerExit {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit.unwrap_or_else(|| ContainerExit::failure("", "container removed before it exited"))
    }

    async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(container = %self.id, "Removing in-process container");
        self.abort.abort();
    }
}
