//! In-memory implementations of the domain ports.
//!
//! These doubles back the unit and integration tests without requiring
//! a live Dojo instance or scanning appliance. They mirror the behavior
//! of the real adapters closely enough to exercise the orchestration
//! logic end to end.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::{
    DispatchItem, PtSummary, ScanNode, ScanTarget, StageOutcome,
};
use orchestrator_domain::repositories::{
    ProductTypeStore, ScanNodeClient, StageExecutor, StickyAssignmentStore, TargetListStore,
};

/// Mock implementation of ProductTypeStore backed by a BTreeMap.
#[derive(Debug, Clone, Default)]
pub struct MemoryProductTypeStore {
    pts: Arc<Mutex<BTreeMap<i64, PtSummary>>>,
    fail_updates_for: Arc<Mutex<HashSet<i64>>>,
}

impl MemoryProductTypeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pt(&self, id: i64, name: &str, description: &str) {
        self.pts.lock().unwrap().insert(
            id,
            PtSummary {
                id,
                name: name.to_string(),
                description: description.to_string(),
                tags: Vec::new(),
            },
        );
    }

    pub fn insert_pt_with_tags(&self, id: i64, name: &str, description: &str, tags: &[&str]) {
        self.pts.lock().unwrap().insert(
            id,
            PtSummary {
                id,
                name: name.to_string(),
                description: description.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
        );
    }

    /// Make update_raw fail for the given PT to exercise isolation paths.
    pub fn fail_updates_for(&self, id: i64) {
        self.fail_updates_for.lock().unwrap().insert(id);
    }

    pub fn raw_of(&self, id: i64) -> Option<String> {
        self.pts
            .lock()
            .unwrap()
            .get(&id)
            .map(|pt| pt.description.clone())
    }
}

#[async_trait]
impl ProductTypeStore for MemoryProductTypeStore {
    async fn list_window(&self, limit: usize) -> OrchestratorResult<Vec<PtSummary>> {
        Ok(self
            .pts
            .lock()
            .unwrap()
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_raw(&self, pt_id: i64) -> OrchestratorResult<String> {
        self.pts
            .lock()
            .unwrap()
            .get(&pt_id)
            .map(|pt| pt.description.clone())
            .ok_or(OrchestratorError::PtNotFound { id: pt_id })
    }

    async fn update_raw(&self, pt_id: i64, raw: &str) -> OrchestratorResult<()> {
        if self.fail_updates_for.lock().unwrap().contains(&pt_id) {
            return Err(OrchestratorError::Internal(format!(
                "simulated update failure for PT {pt_id}"
            )));
        }
        let mut pts = self.pts.lock().unwrap();
        let pt = pts
            .get_mut(&pt_id)
            .ok_or(OrchestratorError::PtNotFound { id: pt_id })?;
        pt.description = raw.to_string();
        Ok(())
    }
}

/// Mock implementation of StickyAssignmentStore.
#[derive(Debug, Clone, Default)]
pub struct MemoryStickyStore {
    map: Arc<Mutex<HashMap<i64, String>>>,
}

impl MemoryStickyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assignment(pt_id: i64, node_name: &str) -> Self {
        let store = Self::new();
        store
            .map
            .lock()
            .unwrap()
            .insert(pt_id, node_name.to_string());
        store
    }
}

#[async_trait]
impl StickyAssignmentStore for MemoryStickyStore {
    async fn get(&self, pt_id: i64) -> OrchestratorResult<Option<String>> {
        Ok(self.map.lock().unwrap().get(&pt_id).cloned())
    }

    async fn set(&self, pt_id: i64, node_name: &str) -> OrchestratorResult<()> {
        self.map
            .lock()
            .unwrap()
            .insert(pt_id, node_name.to_string());
        Ok(())
    }

    async fn remove(&self, pt_id: i64) -> OrchestratorResult<()> {
        self.map.lock().unwrap().remove(&pt_id);
        Ok(())
    }
}

/// Scripted ScanNodeClient: per-node health and session counts are
/// fixed up front, started scans are recorded for assertions.
#[derive(Debug, Clone, Default)]
pub struct StaticNodeClient {
    unhealthy: Arc<Mutex<HashSet<String>>>,
    active: Arc<Mutex<HashMap<String, u32>>>,
    fail_start_on: Arc<Mutex<HashSet<String>>>,
    started: Arc<Mutex<Vec<(String, ScanTarget)>>>,
    health_calls: Arc<Mutex<u32>>,
}

impl StaticNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unhealthy(&self, node_name: &str) {
        self.unhealthy.lock().unwrap().insert(node_name.to_string());
    }

    pub fn set_active_sessions(&self, node_name: &str, count: u32) {
        self.active
            .lock()
            .unwrap()
            .insert(node_name.to_string(), count);
    }

    pub fn fail_start_on(&self, node_name: &str) {
        self.fail_start_on
            .lock()
            .unwrap()
            .insert(node_name.to_string());
    }

    pub fn started_scans(&self) -> Vec<(String, ScanTarget)> {
        self.started.lock().unwrap().clone()
    }

    /// Total health probes observed, to assert "zero network calls" paths.
    pub fn health_calls(&self) -> u32 {
        *self.health_calls.lock().unwrap()
    }
}

#[async_trait]
impl ScanNodeClient for StaticNodeClient {
    async fn health(&self, node: &ScanNode) -> OrchestratorResult<()> {
        *self.health_calls.lock().unwrap() += 1;
        if self.unhealthy.lock().unwrap().contains(&node.name) {
            return Err(OrchestratorError::Internal(format!(
                "node {} is down",
                node.name
            )));
        }
        Ok(())
    }

    async fn active_sessions(&self, node: &ScanNode) -> OrchestratorResult<u32> {
        Ok(self
            .active
            .lock()
            .unwrap()
            .get(&node.name)
            .copied()
            .unwrap_or(0))
    }

    async fn start_scan(&self, node: &ScanNode, target: &ScanTarget) -> OrchestratorResult<String> {
        if self.fail_start_on.lock().unwrap().contains(&node.name) {
            return Err(OrchestratorError::StageExecution(format!(
                "start_scan refused on {}",
                node.name
            )));
        }
        let mut started = self.started.lock().unwrap();
        started.push((node.name.clone(), target.clone()));
        Ok(format!("scan-{}", started.len()))
    }
}

/// In-memory TargetListStore.
#[derive(Debug, Clone, Default)]
pub struct MemoryTargetListStore {
    targets: Arc<Mutex<HashMap<i64, Vec<ScanTarget>>>>,
    dispatched: Arc<Mutex<HashMap<i64, HashSet<String>>>>,
}

impl MemoryTargetListStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_targets(&self, pt_id: i64, urls: &[&str]) {
        let targets = urls
            .iter()
            .map(|url| ScanTarget {
                url: url.to_string(),
                label: format!("pt-{pt_id}"),
            })
            .collect();
        self.targets.lock().unwrap().insert(pt_id, targets);
    }

    pub fn dispatched_count(&self, pt_id: i64) -> usize {
        self.dispatched
            .lock()
            .unwrap()
            .get(&pt_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl TargetListStore for MemoryTargetListStore {
    async fn pending_targets(&self, pt_id: i64) -> OrchestratorResult<Vec<ScanTarget>> {
        let dispatched = self.dispatched.lock().unwrap();
        let done = dispatched.get(&pt_id);
        Ok(self
            .targets
            .lock()
            .unwrap()
            .get(&pt_id)
            .map(|targets| {
                targets
                    .iter()
                    .filter(|t| done.map(|d| !d.contains(&t.url)).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_dispatched(&self, pt_id: i64, target: &ScanTarget) -> OrchestratorResult<()> {
        self.dispatched
            .lock()
            .unwrap()
            .entry(pt_id)
            .or_default()
            .insert(target.url.clone());
        Ok(())
    }
}

/// Scripted StageExecutor: pops pre-seeded outcomes in order, records
/// every dispatch item it receives, and rejects stage mismatches like
/// the real executor does.
pub struct ScriptedStageExecutor {
    stage: orchestrator_domain::entities::Stage,
    outcomes: Mutex<VecDeque<StageOutcome>>,
    default_outcome: StageOutcome,
    calls: Mutex<Vec<DispatchItem>>,
}

impl ScriptedStageExecutor {
    pub fn new(stage: orchestrator_domain::entities::Stage) -> Self {
        Self {
            stage,
            outcomes: Mutex::new(VecDeque::new()),
            default_outcome: StageOutcome::ok(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(stage: orchestrator_domain::entities::Stage, outcome: StageOutcome) -> Self {
        Self {
            stage,
            outcomes: Mutex::new(VecDeque::new()),
            default_outcome: outcome,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_outcome(&self, outcome: StageOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<DispatchItem> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl StageExecutor for ScriptedStageExecutor {
    async fn execute(&self, item: &DispatchItem) -> OrchestratorResult<StageOutcome> {
        if item.stage != self.stage {
            return Err(OrchestratorError::StageExecution(format!(
                "executor for {} got payload for {}",
                self.stage, item.stage
            )));
        }
        self.calls.lock().unwrap().push(item.clone());
        let next = self.outcomes.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.default_outcome.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::entities::{JobMetadata, Stage};

    fn item(stage: Stage) -> DispatchItem {
        DispatchItem {
            pt_id: 1,
            stage,
            job_metadata: JobMetadata {
                source: "test".to_string(),
                queue: stage.as_str().to_string(),
                transition: "t".to_string(),
                lock_owner: "o".to_string(),
                slots: None,
            },
            selected_node: None,
            policy: None,
            tag_signals: vec![],
            target: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_executor_order_and_mismatch() {
        let executor = ScriptedStageExecutor::new(Stage::Nmap);
        executor.push_outcome(StageOutcome::failed("first"));
        executor.push_outcome(StageOutcome::ok());

        let first = executor.execute(&item(Stage::Nmap)).await.unwrap();
        assert!(!first.success);
        let second = executor.execute(&item(Stage::Nmap)).await.unwrap();
        assert!(second.success);
        // queue drained, default kicks in
        let third = executor.execute(&item(Stage::Nmap)).await.unwrap();
        assert!(third.success);

        assert!(executor.execute(&item(Stage::Acu)).await.is_err());
        assert_eq!(executor.call_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryProductTypeStore::new();
        store.insert_pt(1, "pt-1", "desc");
        assert_eq!(store.get_raw(1).await.unwrap(), "desc");
        store.update_raw(1, "new").await.unwrap();
        assert_eq!(store.raw_of(1).unwrap(), "new");
        assert!(store.get_raw(2).await.is_err());
    }

    #[tokio::test]
    async fn test_static_node_client() {
        let client = StaticNodeClient::new();
        client.set_unhealthy("acu-2");
        client.set_active_sessions("acu-1", 3);

        let node = ScanNode {
            name: "acu-1".to_string(),
            endpoint: "https://x".to_string(),
            credential: "k".to_string(),
            max_scans: 5,
            weight: 1,
            active_sessions: 0,
            healthy: false,
        };
        client.health(&node).await.unwrap();
        assert_eq!(client.active_sessions(&node).await.unwrap(), 3);

        let down = ScanNode {
            name: "acu-2".to_string(),
            ..node.clone()
        };
        assert!(client.health(&down).await.is_err());
    }
}
