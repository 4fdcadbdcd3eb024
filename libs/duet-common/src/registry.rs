//! Testcase contract and the name -> testcase registry.
//!
//! The registry is assembled once through [`RegistryBuilder`] and is
//! immutable afterwards, so it can be shared across tasks without locking.

use crate::error::HarnessError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

/// A test with one action run inside the container and one run locally.
/// Both must succeed for the test to pass.
#[async_trait]
pub trait Testcase: Send + Sync {
    /// Unique, stable name used to select the test on both sides.
    fn name(&self) -> &'static str;

    /// Runs inside the container. Receives the address of the host process.
    async fn container_action(&self, peer: IpAddr) -> anyhow::Result<()>;

    /// Runs on the host on its own task. Receives the container's address.
    /// The orchestrator reports its single result to the aggregator.
    async fn local_action(&self, peer: IpAddr) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct RegistryBuilder {
    tests: BTreeMap<&'static str, Arc<dyn Testcase>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, testcase: T) -> Result<&mut Self, HarnessError>
    where
        T: Testcase + 'static,
    {
        self.register_arc(Arc::new(testcase))
    }

    pub fn register_arc(&mut self, testcase: Arc<dyn Testcase>) -> Result<&mut Self, HarnessError> {
        let name = testcase.name();
        if self.tests.contains_key(name) {
            return Err(HarnessError::DuplicateName(name.to_string()));
        }
        self.tests.insert(name, testcase);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry { tests: self.tests }
    }
}

/// Read-only map of test names to testcases.
#[derive(Clone)]
pub struct Registry {
    tests: BTreeMap<&'static str, Arc<dyn Testcase>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Testcase>, HarnessError> {
        self.tests
            .get(name)
            .cloned()
            .ok_or_else(|| HarnessError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tests.contains_key(name)
    }

    /// Sorted test names.
    pub fn names(&self) -> Vec<&'static str> {
        self.tests.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("tests", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Testcase for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn container_action(&self, _peer: IpAddr) -> anyhow::Result<()> {
            Ok(())
        }

        async fn local_action(&self, _peer: IpAddr) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut builder = Registry::builder();
        builder.register(Named("B")).unwrap().register(Named("A")).unwrap();
        let registry = builder.build();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["A", "B"]);
        assert_eq!(registry.lookup("A").unwrap().name(), "A");
        assert!(registry.contains("B"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut builder = Registry::builder();
        builder.register(Named("Echo")).unwrap();

        let err = builder.register(Named("Echo")).err().unwrap();
        assert!(matches!(err, HarnessError::DuplicateName(ref name) if name == "Echo"));

        // The first registration survives.
        assert_eq!(builder.build().len(), 1);
    }

    #[test]
    fn test_lookup_missing() {
        let registry = Registry::builder().build();
        assert!(registry.is_empty());
        let err = registry.lookup("Missing").err().unwrap();
        assert!(matches!(err, HarnessError::NotFound(ref name) if name == "Missing"));
    }
}
