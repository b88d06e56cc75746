//! 阶段级重试策略
//!
//! 重试计数按 last_stage 对应的上限判定。计数单调递增，只有阶段
//! 成功或运维人工清理才会归零——冻结的PT不会自愈。

use tracing::debug;

use orchestrator_core::{OrchestratorError, OrchestratorResult, RetryLimits};
use orchestrator_domain::entities::{PtRecord, PtState, Stage};

pub struct RetryPolicy {
    limits: RetryLimits,
}

impl RetryPolicy {
    pub fn new(limits: RetryLimits) -> Self {
        Self { limits }
    }

    pub fn ceiling(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Subdomains => self.limits.subdomains_max,
            Stage::Nmap => self.limits.nmap_max,
            Stage::Targets => self.limits.targets_max,
            Stage::Acu => self.limits.acu_max,
        }
    }

    /// 冻结判定：error态且失败阶段的重试次数已达上限。
    /// 冻结的PT对诊断仍然可见，但不再被自动准入。
    pub fn is_frozen(&self, record: &PtRecord) -> bool {
        if record.state != PtState::Error {
            return false;
        }
        match record.last_stage {
            Some(stage) => record.retry_count >= self.ceiling(stage),
            // 没有失败历史的error态（人工置位）不按冻结处理
            None => false,
        }
    }

    /// 准入前检查。冻结时返回 `RetryLimitExceeded`，需要运维介入。
    pub fn check_admissible(&self, pt_id: i64, record: &PtRecord) -> OrchestratorResult<()> {
        if self.is_frozen(record) {
            let stage = record
                .last_stage
                .map(|s| s.as_str().to_string())
                .unwrap_or_default();
            debug!(
                "PT {} 已冻结: stage={} retry_count={} last_error={:?}",
                pt_id, stage, record.retry_count, record.last_error
            );
            return Err(OrchestratorError::RetryLimitExceeded {
                pt_id,
                stage,
                count: record.retry_count,
            });
        }
        Ok(())
    }
}
