use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 状态块payload的当前格式版本
pub const STATE_FORMAT_VERSION: u32 = 1;

/// PT生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtState {
    New,
    SubdomainsRunning,
    SubdomainsDone,
    NmapRunning,
    NmapDone,
    TargetsReady,
    AcuRunning,
    Done,
    Error,
}

impl PtState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PtState::New => "new",
            PtState::SubdomainsRunning => "subdomains_running",
            PtState::SubdomainsDone => "subdomains_done",
            PtState::NmapRunning => "nmap_running",
            PtState::NmapDone => "nmap_done",
            PtState::TargetsReady => "targets_ready",
            PtState::AcuRunning => "acu_running",
            PtState::Done => "done",
            PtState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PtState::Done)
    }
}

impl std::fmt::Display for PtState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Subdomains,
    Nmap,
    Targets,
    Acu,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Subdomains => "subdomains",
            Stage::Nmap => "nmap",
            Stage::Targets => "targets",
            Stage::Acu => "acu",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 各阶段累计启动次数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounters {
    #[serde(default)]
    pub subdomains_runs: u32,
    #[serde(default)]
    pub nmap_runs: u32,
    #[serde(default)]
    pub targets_runs: u32,
    #[serde(default)]
    pub acu_runs: u32,
}

impl StageCounters {
    pub fn bump(&mut self, stage: Stage) {
        match stage {
            Stage::Subdomains => self.subdomains_runs += 1,
            Stage::Nmap => self.nmap_runs += 1,
            Stage::Targets => self.targets_runs += 1,
            Stage::Acu => self.acu_runs += 1,
        }
    }

    pub fn runs(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Subdomains => self.subdomains_runs,
            Stage::Nmap => self.nmap_runs,
            Stage::Targets => self.targets_runs,
            Stage::Acu => self.acu_runs,
        }
    }
}

/// 子域名枚举内部扇出的进度计数
///
/// 不变式: done + failed + running <= total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubdomainProgress {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub done: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub running: u32,
}

impl SubdomainProgress {
    /// 完成屏障：所有扇出任务到达终态
    pub fn barrier_reached(&self) -> bool {
        self.running == 0 && self.done + self.failed == self.total
    }

    pub fn is_consistent(&self) -> bool {
        self.done + self.failed + self.running <= self.total
    }

    /// 尚未启动也未终结的任务数
    pub fn remaining(&self) -> u32 {
        self.total
            .saturating_sub(self.done + self.failed + self.running)
    }
}

/// 进入扫描阶段那一刻的策略快照，该轮内不可变，用于事后审计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPolicySnapshot {
    pub fairness: String,
    pub node_selection: String,
    pub sticky_assignment: bool,
    /// 粘性节点不可用、回退到策略选择时置位
    #[serde(default)]
    pub fallback_used: bool,
}

impl DispatchPolicySnapshot {
    pub fn new(node_selection: &str, sticky_assignment: bool) -> Self {
        Self {
            fairness: "round_robin".to_string(),
            node_selection: node_selection.to_string(),
            sticky_assignment,
            fallback_used: false,
        }
    }
}

/// PT状态记录，嵌入在记录源自由文本字段的标记块内
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtRecord {
    pub version: u32,
    pub state: PtState,
    #[serde(default)]
    pub counters: StageCounters,
    #[serde(default)]
    pub subdomains: SubdomainProgress,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_stage: Option<Stage>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub lock_owner: Option<String>,
    #[serde(default)]
    pub lock_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acu_dispatch_policy: Option<DispatchPolicySnapshot>,
}

impl PtRecord {
    /// 首次观察到没有状态块的PT时的初始记录
    pub fn new_at(now: DateTime<Utc>) -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            state: PtState::New,
            counters: StageCounters::default(),
            subdomains: SubdomainProgress::default(),
            retry_count: 0,
            last_stage: None,
            last_error: None,
            last_update: now,
            lock_owner: None,
            lock_until: None,
            acu_dispatch_policy: None,
        }
    }

    /// 租约是否对调用者可用：无人持有、调用者本人持有、或已过期
    pub fn lease_available(&self, caller: &str, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, &self.lock_until) {
            (None, _) => true,
            (Some(owner), _) if owner == caller => true,
            (Some(_), Some(until)) => now > *until,
            // 有owner但没有期限的残留租约按过期处理
            (Some(_), None) => true,
        }
    }

    /// 当前状态隐含的流水线阶段。Error态沿用 last_stage，Done无阶段。
    pub fn implied_stage(&self) -> Option<Stage> {
        match self.state {
            PtState::New | PtState::SubdomainsRunning => Some(Stage::Subdomains),
            PtState::SubdomainsDone | PtState::NmapRunning => Some(Stage::Nmap),
            PtState::NmapDone => Some(Stage::Targets),
            PtState::TargetsReady | PtState::AcuRunning => Some(Stage::Acu),
            PtState::Error => self.last_stage,
            PtState::Done => None,
        }
    }

    /// 阶段失败：进入error态并累计重试计数
    pub fn record_failure(&mut self, stage: Stage, message: &str, now: DateTime<Utc>) {
        self.state = PtState::Error;
        self.retry_count += 1;
        self.last_stage = Some(stage);
        self.last_error = Some(message.to_string());
        self.last_update = now;
    }

    /// 阶段成功推进：重试计数归零
    pub fn record_success(&mut self, stage: Stage, now: DateTime<Utc>) {
        self.retry_count = 0;
        self.last_stage = Some(stage);
        self.last_error = None;
        self.last_update = now;
    }
}

/// 记录源中一个PT的窗口摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtSummary {
    pub id: i64,
    pub name: String,
    /// 自由文本字段原文，状态块嵌在其中
    pub description: String,
    /// 产品上的 needs:* 等标签，仅用于诊断，不参与任何门控
    #[serde(default)]
    pub tags: Vec<String>,
}

/// 扫描节点的运行时视图（配置 + 探测结果）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanNode {
    pub name: String,
    pub endpoint: String,
    pub credential: String,
    pub max_scans: u32,
    pub weight: u32,
    #[serde(default)]
    pub active_sessions: u32,
    #[serde(default)]
    pub healthy: bool,
}

impl ScanNode {
    pub fn free_slots(&self) -> u32 {
        self.max_scans.saturating_sub(self.active_sessions)
    }

    /// 可被选择：健康且有空闲槽位
    pub fn selectable(&self) -> bool {
        self.healthy && self.free_slots() > 0
    }
}

/// 扫描目标（targets阶段产出的一行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTarget {
    pub url: String,
    pub label: String,
}

/// 阶段执行器调用payload的元数据部分
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub source: String,
    pub queue: String,
    pub transition: String,
    pub lock_owner: String,
    /// 本次调用允许占用的全局槽位预算（子域名/nmap阶段）
    #[serde(default)]
    pub slots: Option<u32>,
}

/// 交给阶段执行器的分发单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchItem {
    pub pt_id: i64,
    pub stage: Stage,
    pub job_metadata: JobMetadata,
    #[serde(default)]
    pub selected_node: Option<String>,
    #[serde(default)]
    pub policy: Option<DispatchPolicySnapshot>,
    #[serde(default)]
    pub tag_signals: Vec<String>,
    /// acu阶段的单个扫描目标
    #[serde(default)]
    pub target: Option<ScanTarget>,
}

/// 阶段执行器返回的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub success: bool,
    /// 仍在进行中（仅acu完成检查使用）：既不失败也不推进
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub message: Option<String>,
    /// 子域名阶段的扇出进度快照
    #[serde(default)]
    pub subdomains: Option<SubdomainProgress>,
}

impl StageOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn pending() -> Self {
        Self {
            success: false,
            pending: true,
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            pending: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_subdomains(mut self, progress: SubdomainProgress) -> Self {
        self.subdomains = Some(progress);
        self
    }
}

/// 诊断事件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagStatus {
    Ok,
    Queued,
    Error,
}

/// 统一的诊断/日志事件，阶段执行与节点探测共用一个形状
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagEvent {
    pub pt_id: Option<i64>,
    pub stage: String,
    pub job_id: String,
    pub server: String,
    pub status: DiagStatus,
    pub duration_ms: Option<u64>,
}

impl DiagEvent {
    pub fn ok(pt_id: Option<i64>, stage: &str, job_id: &str, server: &str) -> Self {
        Self {
            pt_id,
            stage: stage.to_string(),
            job_id: job_id.to_string(),
            server: server.to_string(),
            status: DiagStatus::Ok,
            duration_ms: None,
        }
    }

    pub fn queued(pt_id: Option<i64>, stage: &str, job_id: &str, server: &str) -> Self {
        Self {
            status: DiagStatus::Queued,
            ..Self::ok(pt_id, stage, job_id, server)
        }
    }

    pub fn error(pt_id: Option<i64>, stage: &str, job_id: &str, server: &str) -> Self {
        Self {
            status: DiagStatus::Error,
            ..Self::ok(pt_id, stage, job_id, server)
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_subdomain_barrier() {
        let progress = SubdomainProgress {
            total: 10,
            done: 7,
            failed: 3,
            running: 0,
        };
        assert!(progress.barrier_reached());

        let still_running = SubdomainProgress {
            total: 10,
            done: 7,
            failed: 2,
            running: 1,
        };
        assert!(!still_running.barrier_reached());

        // done+failed==total 但 running>0 时屏障不成立
        let inconsistent_but_running = SubdomainProgress {
            total: 10,
            done: 8,
            failed: 2,
            running: 1,
        };
        assert!(!inconsistent_but_running.barrier_reached());
        assert!(!inconsistent_but_running.is_consistent());
    }

    #[test]
    fn test_lease_availability() {
        let now = Utc::now();
        let mut record = PtRecord::new_at(now);
        assert!(record.lease_available("pass-a", now));

        record.lock_owner = Some("pass-a".to_string());
        record.lock_until = Some(now + Duration::minutes(30));
        // 持有者本人可重入
        assert!(record.lease_available("pass-a", now));
        // 其他调用者在租约有效期内被拒绝
        assert!(!record.lease_available("pass-b", now));
        // 过期后任何调用者都可获取
        assert!(record.lease_available("pass-b", now + Duration::minutes(31)));
    }

    #[test]
    fn test_record_failure_and_success() {
        let now = Utc::now();
        let mut record = PtRecord::new_at(now);

        record.record_failure(Stage::Nmap, "connection refused", now);
        assert_eq!(record.state, PtState::Error);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_stage, Some(Stage::Nmap));
        assert_eq!(record.last_error.as_deref(), Some("connection refused"));

        record.record_failure(Stage::Nmap, "timeout", now);
        assert_eq!(record.retry_count, 2);

        record.record_success(Stage::Nmap, now);
        assert_eq!(record.retry_count, 0);
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_implied_stage() {
        let now = Utc::now();
        let mut record = PtRecord::new_at(now);
        assert_eq!(record.implied_stage(), Some(Stage::Subdomains));

        record.state = PtState::TargetsReady;
        assert_eq!(record.implied_stage(), Some(Stage::Acu));

        record.state = PtState::Error;
        record.last_stage = Some(Stage::Targets);
        assert_eq!(record.implied_stage(), Some(Stage::Targets));

        record.state = PtState::Done;
        assert_eq!(record.implied_stage(), None);
    }

    #[test]
    fn test_free_slots_saturates() {
        let node = ScanNode {
            name: "acu-1".to_string(),
            endpoint: "https://10.0.0.1:3443".to_string(),
            credential: "k".to_string(),
            max_scans: 5,
            weight: 1,
            active_sessions: 7,
            healthy: true,
        };
        assert_eq!(node.free_slots(), 0);
        assert!(!node.selectable());
    }
}
