//! 节点池分发器的探测/选择/粘性行为测试

use std::sync::Arc;

use orchestrator_core::{NodeEntry, NodePoolConfig, OrchestratorError};
use orchestrator_dispatcher::NodePoolDispatcher;
use orchestrator_domain::entities::ScanTarget;
use orchestrator_domain::repositories::StickyAssignmentStore;
use orchestrator_infrastructure::{MemoryStickyStore, StaticNodeClient};

fn entry(name: &str, max: Option<u32>, weight: Option<u32>) -> NodeEntry {
    NodeEntry {
        name: name.to_string(),
        endpoint: format!("https://{name}:3443"),
        credential: "key".to_string(),
        max_scans_per_node: max,
        weight,
    }
}

fn pool_config(nodes: Vec<NodeEntry>) -> NodePoolConfig {
    NodePoolConfig {
        nodes,
        default_max_scans_per_node: 5,
        selection_policy: "least_loaded".to_string(),
        sticky_assignment: true,
        probe_timeout_seconds: 2,
        sticky_map_path: "/tmp/unused.json".to_string(),
    }
}

fn target(url: &str) -> ScanTarget {
    ScanTarget {
        url: url.to_string(),
        label: "pt".to_string(),
    }
}

fn dispatcher(
    config: NodePoolConfig,
    client: &Arc<StaticNodeClient>,
    sticky: &Arc<MemoryStickyStore>,
) -> NodePoolDispatcher {
    NodePoolDispatcher::new(
        config,
        Arc::clone(client) as Arc<dyn orchestrator_domain::repositories::ScanNodeClient>,
        Arc::clone(sticky) as Arc<dyn StickyAssignmentStore>,
    )
    .unwrap()
}

#[tokio::test]
async fn test_least_loaded_picks_node_with_most_free_slots() {
    // A(max=5, active=5)满载，B(max=5, active=2)空闲3 → 选B
    let client = Arc::new(StaticNodeClient::new());
    client.set_active_sessions("node-a", 5);
    client.set_active_sessions("node-b", 2);
    let sticky = Arc::new(MemoryStickyStore::new());
    let pool = dispatcher(
        pool_config(vec![entry("node-a", None, None), entry("node-b", None, None)]),
        &client,
        &sticky,
    );

    let mut probe = pool.probe().await;
    assert_eq!(probe.total_free_slots(), 3);
    let node_b = probe.nodes.iter().find(|n| n.name == "node-b").unwrap();
    assert_eq!(node_b.free_slots(), 3);

    let round = pool
        .dispatch_round(&mut probe.nodes, &[(1, target("https://x.com"))])
        .await;
    assert_eq!(round.dispatched.len(), 1);
    assert_eq!(round.dispatched[0].node_name, "node-b");
}

#[tokio::test]
async fn test_unhealthy_node_contributes_zero_capacity() {
    let client = Arc::new(StaticNodeClient::new());
    client.set_unhealthy("node-a");
    let sticky = Arc::new(MemoryStickyStore::new());
    let pool = dispatcher(
        pool_config(vec![entry("node-a", None, None), entry("node-b", None, None)]),
        &client,
        &sticky,
    );

    let probe = pool.probe().await;
    let node_a = probe.nodes.iter().find(|n| n.name == "node-a").unwrap();
    assert!(!node_a.healthy);
    assert_eq!(probe.total_free_slots(), 5);
    // 两个节点都被探测过（不健康的也要探测出诊断事件）
    assert_eq!(probe.events.len(), 2);
}

#[tokio::test]
async fn test_zero_capacity_node_probed_but_never_selected() {
    let client = Arc::new(StaticNodeClient::new());
    let sticky = Arc::new(MemoryStickyStore::new());
    let pool = dispatcher(
        pool_config(vec![entry("node-a", Some(0), None), entry("node-b", None, None)]),
        &client,
        &sticky,
    );

    let mut probe = pool.probe().await;
    let node_a = probe.nodes.iter().find(|n| n.name == "node-a").unwrap();
    // 容量0的节点健康探测照做，但永远选不中
    assert!(node_a.healthy);
    assert_eq!(node_a.free_slots(), 0);

    for _ in 0..3 {
        let round = pool
            .dispatch_round(&mut probe.nodes, &[(1, target("https://x.com"))])
            .await;
        assert_eq!(round.dispatched[0].node_name, "node-b");
    }
}

#[tokio::test]
async fn test_sticky_stability() {
    // 粘性节点健康且有空闲槽时，同一PT反复分发都落同一节点
    let client = Arc::new(StaticNodeClient::new());
    let sticky = Arc::new(MemoryStickyStore::new());
    let pool = dispatcher(
        pool_config(vec![entry("node-a", None, None), entry("node-b", None, None)]),
        &client,
        &sticky,
    );

    let mut probe = pool.probe().await;
    let first = pool
        .dispatch_round(&mut probe.nodes, &[(42, target("https://t1.com"))])
        .await;
    let chosen = first.dispatched[0].node_name.clone();

    for i in 0..3 {
        let round = pool
            .dispatch_round(
                &mut probe.nodes,
                &[(42, target(&format!("https://t{}.com", i + 2)))],
            )
            .await;
        assert_eq!(round.dispatched[0].node_name, chosen);
        assert!(!round.dispatched[0].fallback_used);
    }
}

#[tokio::test]
async fn test_sticky_fallback_when_node_full() {
    let client = Arc::new(StaticNodeClient::new());
    client.set_active_sessions("node-a", 5); // 满载
    let sticky = Arc::new(MemoryStickyStore::new());
    sticky.set(7, "node-a").await.unwrap();
    let pool = dispatcher(
        pool_config(vec![entry("node-a", None, None), entry("node-b", None, None)]),
        &client,
        &sticky,
    );

    let mut probe = pool.probe().await;
    let round = pool
        .dispatch_round(&mut probe.nodes, &[(7, target("https://x.com"))])
        .await;
    assert_eq!(round.dispatched.len(), 1);
    assert_eq!(round.dispatched[0].node_name, "node-b");
    assert!(round.dispatched[0].fallback_used);
    // 粘性表改绑
    assert_eq!(sticky.get(7).await.unwrap(), Some("node-b".to_string()));
}

#[tokio::test]
async fn test_sticky_node_removed_from_config_falls_back() {
    let client = Arc::new(StaticNodeClient::new());
    let sticky = Arc::new(MemoryStickyStore::new());
    sticky.set(7, "node-gone").await.unwrap();
    let pool = dispatcher(pool_config(vec![entry("node-b", None, None)]), &client, &sticky);

    let mut probe = pool.probe().await;
    let round = pool
        .dispatch_round(&mut probe.nodes, &[(7, target("https://x.com"))])
        .await;
    assert_eq!(round.dispatched[0].node_name, "node-b");
    assert!(round.dispatched[0].fallback_used);
}

#[tokio::test]
async fn test_no_free_slot_defers_item() {
    let client = Arc::new(StaticNodeClient::new());
    client.set_active_sessions("node-a", 5);
    let sticky = Arc::new(MemoryStickyStore::new());
    let pool = dispatcher(pool_config(vec![entry("node-a", None, None)]), &client, &sticky);

    let mut probe = pool.probe().await;
    let round = pool
        .dispatch_round(&mut probe.nodes, &[(1, target("https://x.com"))])
        .await;
    assert!(round.dispatched.is_empty());
    assert!(round.errors.is_empty());
    assert_eq!(round.deferred, 1);
}

#[tokio::test]
async fn test_start_scan_error_is_hard_error_not_deferral() {
    let client = Arc::new(StaticNodeClient::new());
    client.fail_start_on("node-a");
    let sticky = Arc::new(MemoryStickyStore::new());
    let pool = dispatcher(pool_config(vec![entry("node-a", None, None)]), &client, &sticky);

    let mut probe = pool.probe().await;
    let round = pool
        .dispatch_round(&mut probe.nodes, &[(1, target("https://x.com"))])
        .await;
    assert!(round.dispatched.is_empty());
    assert_eq!(round.deferred, 0);
    assert_eq!(round.errors.len(), 1);
    assert_eq!(round.errors[0].0, 1);
}

#[test]
fn test_config_without_credentials_is_fatal() {
    let client = Arc::new(StaticNodeClient::new());
    let sticky = Arc::new(MemoryStickyStore::new());
    let mut config = pool_config(vec![entry("node-a", None, None)]);
    config.nodes[0].credential = String::new();

    let result = NodePoolDispatcher::new(config, client, sticky);
    assert!(matches!(
        result,
        Err(OrchestratorError::Configuration(_))
    ));
}

#[test]
fn test_unknown_policy_is_fatal() {
    let client = Arc::new(StaticNodeClient::new());
    let sticky = Arc::new(MemoryStickyStore::new());
    let mut config = pool_config(vec![entry("node-a", None, None)]);
    config.selection_policy = "round_robin".to_string();

    let result = NodePoolDispatcher::new(config, client, sticky);
    assert!(matches!(
        result,
        Err(OrchestratorError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_weighted_policy_dispatches_to_free_nodes_only() {
    let client = Arc::new(StaticNodeClient::new());
    client.set_active_sessions("node-a", 5); // 满载
    let sticky = Arc::new(MemoryStickyStore::new());
    let mut config = pool_config(vec![
        entry("node-a", None, Some(100)),
        entry("node-b", None, Some(1)),
    ]);
    config.selection_policy = "weighted".to_string();
    config.sticky_assignment = false;
    let pool = dispatcher(config, &client, &sticky);

    let mut probe = pool.probe().await;
    for i in 0..5 {
        let round = pool
            .dispatch_round(
                &mut probe.nodes,
                &[(1, target(&format!("https://t{i}.com")))],
            )
            .await;
        // 高权重节点没有空闲槽，不参与加权抽签
        assert_eq!(round.dispatched[0].node_name, "node-b");
    }
}
