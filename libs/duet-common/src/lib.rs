pub mod cases;
pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod registry;
pub mod types;

pub use error::HarnessError;
pub use registry::{Registry, RegistryBuilder, Testcase};
pub use types::{ContainerExit, Outcome, Side, Verdict};
