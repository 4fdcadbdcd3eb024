//! Built-in testcases. The same registry is compiled into the container
//! runner and the host so both sides agree on names.

mod echo;
mod filter_input;
pub mod net;

pub use echo::Echo;
pub use filter_input::{
    DropAll, FilterInputDropDifferentUdpPort, FilterInputDropUdp, FilterInputDropUdpPort,
};

use crate::error::HarnessError;
use crate::registry::Registry;

/// Every built-in testcase. New tests are added here.
pub fn default_registry() -> Result<Registry, HarnessError> {
    let mut builder = Registry::builder();
    builder
        .register(Echo)?
        .register(DropAll)?
        .register(FilterInputDropUdp)?
        .register(FilterInputDropUdpPort)?
        .register(FilterInputDropDifferentUdpPort)?;
    Ok(builder.build())
}
