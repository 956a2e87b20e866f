//! Orchestrator fixture over the in-memory driver
//!
//! Timings are shortened so retries, sweeps and polling finish within a
//! test's patience.

use aggrelite::{
    DriverRegistry, MemoryDriver, OrchestratorConfig, PreAggregationDefinition, QueryOrchestrator,
};
use std::sync::Arc;
use std::time::Duration;

pub const DATA_SOURCE: &str = "default";

pub struct TestFixture {
    pub driver: Arc<MemoryDriver>,
    pub orchestrator: QueryOrchestrator,
}

impl TestFixture {
    /// Fixture with the fast configuration and no pre-aggregations
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        Self::with_driver(config, Arc::new(MemoryDriver::new()), Vec::new())
    }

    pub fn with_definitions(definitions: Vec<PreAggregationDefinition>) -> Self {
        Self::with_driver(fast_config(), Arc::new(MemoryDriver::new()), definitions)
    }

    pub fn with_driver(
        config: OrchestratorConfig,
        driver: Arc<MemoryDriver>,
        definitions: Vec<PreAggregationDefinition>,
    ) -> Self {
        super::init_logging();
        let orchestrator = QueryOrchestrator::builder(config, registry(&driver))
            .with_definitions(definitions)
            .build()
            .expect("Failed to build orchestrator");
        Self {
            driver,
            orchestrator,
        }
    }
}

pub fn registry(driver: &Arc<MemoryDriver>) -> DriverRegistry {
    DriverRegistry::new().with_driver(DATA_SOURCE, driver.clone())
}

/// Defaults with millisecond-scale backoff, polling and grace periods
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.queue.backoff_base = Duration::from_millis(5);
    config.queue.backoff_max = Duration::from_millis(20);
    config.queue.lease_renew_interval = Duration::from_millis(20);
    config.queue.result_poll_interval = Duration::from_millis(10);
    config.queue.cancel_grace = Duration::from_millis(100);
    config.queue.acquire_timeout = Duration::from_secs(2);
    config.scheduler.enabled = false;
    config
}
