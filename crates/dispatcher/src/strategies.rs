//! 节点选择策略
//!
//! 封闭的两变体：least_loaded 与 weighted。粘性命中是独立的前置
//! 装饰步骤（见node_pool），策略只在粘性未命中或被禁用时兜底。
//! 平局一律按节点名字典序打破，保证决策可复现。

use tracing::debug;

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::ScanNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    LeastLoaded,
    Weighted,
}

impl SelectionPolicy {
    pub fn parse(value: &str) -> OrchestratorResult<Self> {
        match value {
            "least_loaded" => Ok(SelectionPolicy::LeastLoaded),
            "weighted" => Ok(SelectionPolicy::Weighted),
            other => Err(OrchestratorError::Configuration(format!(
                "未知的节点选择策略: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::LeastLoaded => "least_loaded",
            SelectionPolicy::Weighted => "weighted",
        }
    }

    /// 从候选中选一个节点。候选必须已按「健康且有空闲槽」过滤，
    /// 空候选返回None（延后处理，不是错误）。
    pub fn select<'a>(&self, candidates: &[&'a ScanNode]) -> Option<&'a ScanNode> {
        if candidates.is_empty() {
            return None;
        }
        let chosen = match self {
            SelectionPolicy::LeastLoaded => self.select_least_loaded(candidates),
            SelectionPolicy::Weighted => self.select_weighted(candidates),
        };
        if let Some(node) = chosen {
            debug!(
                "策略 {} 选中节点 {} (free_slots={})",
                self.as_str(),
                node.name,
                node.free_slots()
            );
        }
        chosen
    }

    fn select_least_loaded<'a>(&self, candidates: &[&'a ScanNode]) -> Option<&'a ScanNode> {
        candidates.iter().copied().min_by(|a, b| {
            b.free_slots()
                .cmp(&a.free_slots())
                .then_with(|| a.name.cmp(&b.name))
        })
    }

    fn select_weighted<'a>(&self, candidates: &[&'a ScanNode]) -> Option<&'a ScanNode> {
        let total: u64 = candidates.iter().map(|n| n.weight as u64).sum();
        if total == 0 {
            // 权重全为0时退化为字典序首节点
            return candidates.iter().copied().min_by(|a, b| a.name.cmp(&b.name));
        }

        let mut point = rand::random::<f64>() * total as f64;
        for node in candidates {
            point -= node.weight as f64;
            if point < 0.0 {
                return Some(node);
            }
        }
        // 浮点边界兜底
        candidates.last().copied()
    }
}
