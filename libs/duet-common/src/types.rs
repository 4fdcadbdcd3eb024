use crate::error::HarnessError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which half of a test produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Container,
    Local,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Container => write!(f, "container"),
            Side::Local => write!(f, "local"),
        }
    }
}

/// Result of one side of a test.
#[derive(Debug)]
pub enum Outcome {
    Passed,
    Failed(HarnessError),
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }
}

impl From<Result<(), HarnessError>> for Outcome {
    fn from(result: Result<(), HarnessError>) -> Self {
        match result {
            Ok(()) => Outcome::Passed,
            Err(e) => Outcome::Failed(e),
        }
    }
}

/// Combined result of a whole run.
#[derive(Debug)]
pub enum Verdict {
    Passed,
    Failed(HarnessError),
}

impl Verdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }

    pub fn cause(&self) -> Option<&HarnessError> {
        match self {
            Verdict::Passed => None,
            Verdict::Failed(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<(), HarnessError> {
        match self {
            Verdict::Passed => Ok(()),
            Verdict::Failed(e) => Err(e),
        }
    }
}

impl From<HarnessError> for Verdict {
    fn from(err: HarnessError) -> Self {
        Verdict::Failed(err)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => write!(f, "PASS"),
            Verdict::Failed(e) => write!(f, "FAIL: {}", e),
        }
    }
}

/// What the container runner hands back once the environment exits:
/// combined stdout/stderr plus the error, if the environment failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerExit {
    pub output: String,
    pub error: Option<String>,
}

impl ContainerExit {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: Some(error.into()),
        }
    }

    /// The container process reports test failures through its exit status,
    /// so a failed exit is the container side's domain outcome.
    pub fn outcome(&self) -> Outcome {
        match &self.error {
            None => Outcome::Passed,
            Some(err) => Outcome::Failed(HarnessError::Domain {
                side: Side::Container,
                message: err.clone(),
            }),
        }
    }
}
