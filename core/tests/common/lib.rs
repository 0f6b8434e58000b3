#![allow(clippy::expect_used)]

use std::future::Future;
use std::time::Duration;

use agent_exec_core::OrchestratorConfig;
use agent_exec_core::ProcessId;
use agent_exec_core::ProcessManager;
use agent_exec_core::ProcessSnapshot;

/// Generous upper bound for anything a test waits on.
pub const TEST_DEADLINE: Duration = Duration::from_secs(10);

/// Config with short grace/drain periods so failures surface quickly.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        kill_grace_period_ms: 200,
        output_drain_timeout_ms: 200,
        ..OrchestratorConfig::default()
    }
}

pub fn test_manager() -> ProcessManager {
    ProcessManager::new(test_config())
}

/// Polls `check` until it yields a value, panicking after [`TEST_DEADLINE`].
pub async fn wait_for<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + TEST_DEADLINE;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn snapshot(manager: &ProcessManager, id: ProcessId) -> ProcessSnapshot {
    manager.get(id).await.expect("process record present")
}
