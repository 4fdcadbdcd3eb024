// Container log sink: artifact file when an output directory is configured,
// the log stream otherwise. Never affects the verdict.
use anyhow::{Context, Result};
use duet_common::ContainerExit;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    artifacts_dir: Option<PathBuf>,
}

impl Diagnostics {
    pub fn new(artifacts_dir: Option<PathBuf>) -> Self {
        Self { artifacts_dir }
    }

    pub fn log_path(&self, test_name: &str) -> Option<PathBuf> {
        self.artifacts_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.container.log", test_name)))
    }

    /// Record the container's output. Returns the file written, if any.
    pub async fn record(&self, test_name: &str, exit: &ContainerExit) -> Option<PathBuf> {
        let msg = render(test_name, exit);

        if let Some(path) = self.log_path(test_name) {
            match write_log(&path, &msg).await {
                Ok(()) => return Some(path),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write container log"),
            }
        }

        // We couldn't write to the output directory -- just log it.
        info!("{}", msg);
        None
    }
}

fn render(test_name: &str, exit: &ContainerExit) -> String {
    format!(
        "Test: {}\nFinished: {}\nContainer error: {}\nContainer output:\n{}",
        test_name,
        chrono::Utc::now().to_rfc3339(),
        exit.error.as_deref().unwrap_or("<nil>"),
        exit.output
    )
}

async fn write_log(path: &Path, msg: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, msg)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
