/// Docker-backed container runner
///
/// **Docker Execution Rules:**
/// 1. Pulls the runner image if not present
/// 2. Creates a uniquely named container with the requested capabilities
///    (NET_ADMIN so the test can edit iptables rules)
/// 3. Networking stays enabled: the test talks to the host over the bridge
/// 4. Captures stdout/stderr as one combined stream
/// 5. Non-zero exit status is reported as the container's error
/// 6. Container is force-removed on cleanup

use crate::runner::{ContainerHandle, ContainerRunner, ContainerSpec};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use duet_common::exchange::AddressSource;
use duet_common::{ContainerExit, HarnessError};
use futures_util::stream::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    pub fn connect() -> anyhow::Result<Self> {
        use anyhow::Context;
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), HarnessError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("✓ Image cache hit: {}", image);
            return Ok(());
        }

        warn!("⚠ Image cache miss: {} (pulling now)", image);

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| {
                HarnessError::Container(format!("failed to pull image {}: {}", image, e))
            })?;
        }

        info!("✓ Image pulled successfully: {}", image);
        Ok(())
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn start(&self, spec: &ContainerSpec) -> Result<Arc<dyn ContainerHandle>, HarnessError> {
        self.ensure_image(&spec.image).await?;

        let container_name = format!("duet-{}", uuid::Uuid::new_v4());

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(bollard::models::HostConfig {
                cap_add: Some(spec.capabilities.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| HarnessError::Container(format!("failed to create container: {}", e)))?;

        let handle = DockerContainer {
            docker: self.docker.clone(),
            id: container.id,
            cleaned: AtomicBool::new(false),
        };

        if let Err(e) = self
            .docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
        {
            handle.cleanup().await;
            return Err(HarnessError::Container(format!(
                "failed to start container: {}",
                e
            )));
        }

        info!(
            container = %handle.id,
            name = %container_name,
            image = %spec.image,
            test = %spec.test_name,
            "Container started"
        );
        Ok(Arc::new(handle))
    }
}

struct DockerContainer {
    docker: Docker,
    id: String,
    cleaned: AtomicBool,
}

#[async_trait]
impl AddressSource for DockerContainer {
    async fn find_address(&self) -> anyhow::Result<Option<String>> {
        let inspect = self
            .docker
            .inspect_container(&self.id, None::<InspectContainerOptions>)
            .await?;

        let Some(settings) = inspect.network_settings else {
            return Ok(None);
        };

        if let Some(ip) = settings.ip_address.filter(|ip| !ip.is_empty()) {
            return Ok(Some(ip));
        }

        // User-defined networks leave the top-level address empty.
        let from_networks = settings.networks.and_then(|networks| {
            networks
                .into_values()
                .filter_map(|endpoint| endpoint.ip_address)
                .find(|ip| !ip.is_empty())
        });
        Ok(from_networks)
    }
}

#[async_trait]
impl ContainerHandle for DockerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&self) -> ContainerExit {
        let mut output = String::new();

        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });

        let mut logs_stream = self.docker.logs(&self.id, logs_options);
        while let Some(chunk) = logs_stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container = %self.id, error = %e, "Error reading container logs");
                    break;
                }
            }
        }

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut wait_stream = self.docker.wait_container(&self.id, Some(wait_options));
        let error = match wait_stream.next().await {
            Some(Ok(response)) if response.status_code == 0 => None,
            Some(Ok(response)) => Some(format!("exit status {}", response.status_code)),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Some(format!("exit status {}", code))
            }
            Some(Err(e)) => Some(format!("failed waiting for container: {}", e)),
            None => Some("no wait response from container".to_string()),
        };

        debug!(container = %self.id, error = ?error, "Container exited");
        ContainerExit { output, error }
    }

    async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }

        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        if let Err(e) = self.docker.remove_container(&self.id, Some(remove_options)).await {
            warn!(container = %self.id, error = %e, "⚠ Failed to cleanup container");
        } else {
            debug!(container = %self.id, "Container removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Orchestrator;
    use duet_common::config::HarnessConfig;
    use std::time::{Duration, Instant};

    /// Requires a Docker daemon and the runner image.
    #[tokio::test]
    #[ignore]
    async fn test_docker_runner_reports_address() {
        let runner = DockerRunner::connect().expect("Failed to connect to Docker");
        let config = HarnessConfig::default();

        let handle = runner
            .start(&ContainerSpec::for_test(&config, "Echo"))
            .await
            .expect("Failed to start container");

        let mut address = None;
        for _ in 0..20 {
            if let Ok(Some(ip)) = handle.find_address().await {
                address = Some(ip);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }

        handle.cleanup().await;
        assert!(address.is_some(), "Container never reported an address");
    }

    /// Requires a Docker daemon and the runner image (docker/Dockerfile.runner).
    #[tokio::test]
    #[ignore]
    async fn test_filter_input_cases_pass_in_docker() {
        let registry = duet_common::cases::default_registry().expect("Failed to build registry");
        let runner = DockerRunner::connect().expect("Failed to connect to Docker");
        // Pull up front so image download time stays out of the timing below.
        let config = HarnessConfig::default();
        runner
            .ensure_image(&config.image)
            .await
            .expect("Failed to pull runner image");

        let orchestrator = Orchestrator::new(registry, Box::new(runner), config);

        for name in ["DropAll", "FilterInputDropDifferentUDPPort"] {
            let start = Instant::now();
            let verdict = orchestrator.run(name).await;

            assert!(verdict.is_passed(), "{}: {}", name, verdict);
            // Two second send loop plus container start and handshake.
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "{} took {:?}",
                name,
                start.elapsed()
            );
        }
    }
}
