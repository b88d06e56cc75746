//! 扫描节点池分发器
//!
//! 每轮流程：并行健康探测 → 计算空闲槽位 → 按PT轮转交织出公平队列 →
//! 逐项选节点（粘性优先，策略兜底）并启动扫描。探测失败只降级该
//! 节点，不中断整轮；真正致命的只有「无任何可用凭证」这类配置错误，
//! 那种情况在构造时就被拒绝，一个请求都不会发出去。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use orchestrator_core::{NodePoolConfig, OrchestratorResult};
use orchestrator_domain::entities::{DiagEvent, DispatchPolicySnapshot, ScanNode, ScanTarget};
use orchestrator_domain::repositories::{ScanNodeClient, StickyAssignmentStore};

use crate::strategies::SelectionPolicy;

/// 探测阶段在诊断事件里使用的stage名
const POOL_STAGE: &str = "pool";

pub struct NodePoolDispatcher {
    config: NodePoolConfig,
    policy: SelectionPolicy,
    client: Arc<dyn ScanNodeClient>,
    sticky: Arc<dyn StickyAssignmentStore>,
}

/// 一次节点探测的结果
#[derive(Debug)]
pub struct ProbeReport {
    pub nodes: Vec<ScanNode>,
    pub events: Vec<DiagEvent>,
}

impl ProbeReport {
    pub fn total_free_slots(&self) -> u32 {
        self.nodes
            .iter()
            .filter(|n| n.healthy)
            .map(|n| n.free_slots())
            .sum()
    }
}

/// 队列里一个目标的成功分发
#[derive(Debug, Clone)]
pub struct TargetDispatch {
    pub pt_id: i64,
    pub target: ScanTarget,
    pub node_name: String,
    pub job_id: String,
    pub fallback_used: bool,
}

/// 一轮分发的汇总
#[derive(Debug, Default)]
pub struct DispatchRoundResult {
    pub dispatched: Vec<TargetDispatch>,
    /// 启动扫描时的硬错误（pt_id, 错误信息）
    pub errors: Vec<(i64, String)>,
    /// 因无空闲节点而留到下一轮的目标数
    pub deferred: u32,
    pub events: Vec<DiagEvent>,
}

impl NodePoolDispatcher {
    /// 构造时执行致命校验：节点清单不可解析或全部缺凭证时直接
    /// 返回 `Configuration` 错误，后续不会发出任何网络请求。
    pub fn new(
        config: NodePoolConfig,
        client: Arc<dyn ScanNodeClient>,
        sticky: Arc<dyn StickyAssignmentStore>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;
        let policy = SelectionPolicy::parse(&config.selection_policy)?;
        Ok(Self {
            config,
            policy,
            client,
            sticky,
        })
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn sticky_enabled(&self) -> bool {
        self.config.sticky_assignment
    }

    fn policy_snapshot(&self, fallback_used: bool) -> DispatchPolicySnapshot {
        DispatchPolicySnapshot {
            fairness: "round_robin".to_string(),
            node_selection: self.policy.as_str().to_string(),
            sticky_assignment: self.config.sticky_assignment,
            fallback_used,
        }
    }

    /// 并行探测所有配置节点。单节点超时/失败只把该节点降级为
    /// 不健康（容量归零），容量为0的节点照样探测以便诊断。
    pub async fn probe(&self) -> ProbeReport {
        let timeout = Duration::from_secs(self.config.probe_timeout_seconds);

        let probes = self.config.nodes.iter().map(|entry| {
            let node = ScanNode {
                name: entry.name.clone(),
                endpoint: entry.endpoint.clone(),
                credential: entry.credential.clone(),
                max_scans: self.config.effective_max_scans(entry),
                weight: entry.weight.unwrap_or(1),
                active_sessions: 0,
                healthy: false,
            };
            async move {
                let started = Instant::now();
                if !entry.has_credential() {
                    let event = DiagEvent::error(None, POOL_STAGE, "probe", &node.name);
                    return (node, event);
                }
                let probed = tokio::time::timeout(timeout, async {
                    self.client.health(&node).await?;
                    self.client.active_sessions(&node).await
                })
                .await;
                let duration_ms = started.elapsed().as_millis() as u64;

                match probed {
                    Ok(Ok(active)) => {
                        let node = ScanNode {
                            active_sessions: active,
                            healthy: true,
                            ..node
                        };
                        let event = DiagEvent::ok(None, POOL_STAGE, "probe", &node.name)
                            .with_duration(duration_ms);
                        (node, event)
                    }
                    Ok(Err(e)) => {
                        warn!("节点 {} 探测失败: {e}", node.name);
                        let event = DiagEvent::error(None, POOL_STAGE, "probe", &node.name)
                            .with_duration(duration_ms);
                        (node, event)
                    }
                    Err(_) => {
                        warn!(
                            "节点 {} 探测超时（{}秒），按不健康处理",
                            node.name, self.config.probe_timeout_seconds
                        );
                        let event = DiagEvent::error(None, POOL_STAGE, "probe", &node.name)
                            .with_duration(duration_ms);
                        (node, event)
                    }
                }
            }
        });

        let results = futures::future::join_all(probes).await;
        let (nodes, events): (Vec<_>, Vec<_>) = results.into_iter().unzip();

        info!(
            "节点探测完成: {}/{} 健康, 空闲槽位合计 {}",
            nodes.iter().filter(|n| n.healthy).count(),
            nodes.len(),
            nodes
                .iter()
                .filter(|n| n.healthy)
                .map(|n| n.free_slots())
                .sum::<u32>()
        );

        ProbeReport { nodes, events }
    }

    /// 公平队列：按PT轮转交织，目标多的PT不能在别的PT分到任何
    /// 槽位之前吃光全部容量
    pub fn build_queue(eligible: &[(i64, Vec<ScanTarget>)]) -> Vec<(i64, ScanTarget)> {
        let mut queue = Vec::new();
        let mut cursors: Vec<(i64, std::slice::Iter<'_, ScanTarget>)> = eligible
            .iter()
            .map(|(pt_id, targets)| (*pt_id, targets.iter()))
            .collect();

        loop {
            let mut progressed = false;
            for (pt_id, cursor) in cursors.iter_mut() {
                if let Some(target) = cursor.next() {
                    queue.push((*pt_id, target.clone()));
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        queue
    }

    /// 为一个PT选节点。粘性命中优先；粘性节点消失/不健康/满载时
    /// 回退到策略选择并在返回值里标记。返回节点在slice中的下标。
    async fn select_for(&self, pt_id: i64, nodes: &[ScanNode]) -> (Option<usize>, bool) {
        let mut sticky_missed = false;

        if self.config.sticky_assignment {
            match self.sticky.get(pt_id).await {
                Ok(Some(name)) => match nodes.iter().position(|n| n.name == name) {
                    Some(idx) if nodes[idx].selectable() => {
                        debug!("PT {} 粘性命中节点 {}", pt_id, name);
                        return (Some(idx), false);
                    }
                    _ => {
                        debug!("PT {} 的粘性节点 {} 不可用，回退策略选择", pt_id, name);
                        sticky_missed = true;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!("读取PT {} 粘性分配失败: {e}，回退策略选择", pt_id);
                    sticky_missed = true;
                }
            }
        }

        let candidates: Vec<&ScanNode> = nodes.iter().filter(|n| n.selectable()).collect();
        let chosen = self
            .policy
            .select(&candidates)
            .map(|node| nodes.iter().position(|n| n.name == node.name).unwrap());
        (chosen, sticky_missed)
    }

    /// 跑完一整条公平队列：逐项选节点、启动扫描、更新粘性表。
    /// 没有空闲节点的目标留给下一轮（deferred），不算错误。
    pub async fn dispatch_round(
        &self,
        nodes: &mut [ScanNode],
        queue: &[(i64, ScanTarget)],
    ) -> DispatchRoundResult {
        let mut result = DispatchRoundResult::default();

        for (pt_id, target) in queue {
            let (chosen, fallback_used) = self.select_for(*pt_id, nodes).await;
            let idx = match chosen {
                Some(idx) => idx,
                None => {
                    result.deferred += 1;
                    continue;
                }
            };

            let started = Instant::now();
            let node_name = nodes[idx].name.clone();
            match self.client.start_scan(&nodes[idx], target).await {
                Ok(job_id) => {
                    nodes[idx].active_sessions += 1;
                    if self.config.sticky_assignment {
                        if let Err(e) = self.sticky.set(*pt_id, &node_name).await {
                            warn!("更新PT {} 粘性分配失败: {e}", pt_id);
                        }
                    }
                    result.events.push(
                        DiagEvent::queued(Some(*pt_id), "acu", &job_id, &node_name)
                            .with_duration(started.elapsed().as_millis() as u64),
                    );
                    result.dispatched.push(TargetDispatch {
                        pt_id: *pt_id,
                        target: target.clone(),
                        node_name,
                        job_id,
                        fallback_used,
                    });
                }
                Err(e) => {
                    let job_id = Uuid::new_v4().to_string();
                    warn!(
                        "PT {} 在节点 {} 启动扫描失败: {e} (target={})",
                        pt_id, node_name, target.url
                    );
                    result.events.push(
                        DiagEvent::error(Some(*pt_id), "acu", &job_id, &node_name)
                            .with_duration(started.elapsed().as_millis() as u64),
                    );
                    result.errors.push((*pt_id, e.to_string()));
                }
            }
        }

        result
    }

    /// 一个PT本轮分发结果对应的策略快照
    pub fn snapshot_for(&self, dispatches: &[&TargetDispatch]) -> DispatchPolicySnapshot {
        let fallback_used = dispatches.iter().any(|d| d.fallback_used);
        self.policy_snapshot(fallback_used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> ScanTarget {
        ScanTarget {
            url: url.to_string(),
            label: "pt".to_string(),
        }
    }

    #[test]
    fn test_queue_interleaves_by_pt() {
        let eligible = vec![
            (1_i64, vec![target("https://a1"), target("https://a2"), target("https://a3")]),
            (2_i64, vec![target("https://b1")]),
            (3_i64, vec![target("https://c1"), target("https://c2")]),
        ];

        let queue = NodePoolDispatcher::build_queue(&eligible);
        let order: Vec<(i64, String)> = queue
            .into_iter()
            .map(|(pt, t)| (pt, t.url))
            .collect();

        assert_eq!(
            order,
            vec![
                (1, "https://a1".to_string()),
                (2, "https://b1".to_string()),
                (3, "https://c1".to_string()),
                (1, "https://a2".to_string()),
                (3, "https://c2".to_string()),
                (1, "https://a3".to_string()),
            ]
        );
    }

    #[test]
    fn test_queue_empty() {
        assert!(NodePoolDispatcher::build_queue(&[]).is_empty());
        assert!(NodePoolDispatcher::build_queue(&[(1, vec![])]).is_empty());
    }
}
