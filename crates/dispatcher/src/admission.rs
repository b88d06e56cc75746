//! 准入控制器
//!
//! 一轮内有两种全局资源按槽位配给：子域名枚举任务（按扇出任务计数，
//! 单个PT可以同时占多个槽）和nmap任务（按处于nmap阶段的PT计数）。
//! 账本在每轮开始时用窗口内已解码记录的计数播种，轮内用原子操作
//! 增减，是多PT并发处理时唯一的共享可变点之一。
//!
//! 对单个PT的互斥靠写进状态块里的乐观租约（owner + TTL）。

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use orchestrator_core::{LimitsConfig, OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::{PtRecord, PtState};

/// 本轮的租约持有者身份
#[derive(Debug, Clone)]
pub struct PassIdentity {
    pub owner: String,
}

impl PassIdentity {
    /// 形如 `host:uuid`，同主机的两轮也互不相同
    pub fn generate() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self {
            owner: format!("{host}:{}", Uuid::new_v4()),
        }
    }

    pub fn named(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
        }
    }
}

/// 准入控制器：全局槽位账本 + PT租约
pub struct AdmissionController {
    limits: LimitsConfig,
    identity: PassIdentity,
    subdomain_slots_used: AtomicU32,
    nmap_slots_used: AtomicU32,
}

impl AdmissionController {
    pub fn new(limits: LimitsConfig, identity: PassIdentity) -> Self {
        Self {
            limits,
            identity,
            subdomain_slots_used: AtomicU32::new(0),
            nmap_slots_used: AtomicU32::new(0),
        }
    }

    pub fn owner(&self) -> &str {
        &self.identity.owner
    }

    /// 用窗口内的记录播种账本：子域名槽按running总和，nmap槽按
    /// 处于nmap_running的PT数
    pub fn seed_from_window(&self, records: &[PtRecord]) {
        let subdomain_running: u32 = records.iter().map(|r| r.subdomains.running).sum();
        let nmap_running = records
            .iter()
            .filter(|r| r.state == PtState::NmapRunning)
            .count() as u32;

        self.subdomain_slots_used
            .store(subdomain_running, Ordering::SeqCst);
        self.nmap_slots_used.store(nmap_running, Ordering::SeqCst);

        if subdomain_running > self.limits.subdomains_concurrency {
            warn!(
                "窗口内子域名running总数 {} 已超过并发上限 {}，本轮不再准入新任务",
                subdomain_running, self.limits.subdomains_concurrency
            );
        }
        debug!(
            "账本播种完成: subdomains_used={} nmap_used={}",
            subdomain_running, nmap_running
        );
    }

    /// 申请至多want个子域名槽位，返回实际授予数（0表示无可用槽）
    pub fn try_acquire_subdomain_slots(&self, want: u32) -> u32 {
        if want == 0 {
            return 0;
        }
        let cap = self.limits.subdomains_concurrency;
        let mut current = self.subdomain_slots_used.load(Ordering::SeqCst);
        loop {
            if current >= cap {
                return 0;
            }
            let grant = want.min(cap - current);
            match self.subdomain_slots_used.compare_exchange(
                current,
                current + grant,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return grant,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release_subdomain_slots(&self, count: u32) {
        if count == 0 {
            return;
        }
        let mut current = self.subdomain_slots_used.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(count);
            match self.subdomain_slots_used.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// 申请一个nmap槽位
    pub fn try_acquire_nmap_slot(&self) -> bool {
        let cap = self.limits.nmap_concurrency;
        let mut current = self.nmap_slots_used.load(Ordering::SeqCst);
        loop {
            if current >= cap {
                return false;
            }
            match self.nmap_slots_used.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release_nmap_slot(&self) {
        let mut current = self.nmap_slots_used.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(1);
            match self.nmap_slots_used.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn subdomain_slots_in_use(&self) -> u32 {
        self.subdomain_slots_used.load(Ordering::SeqCst)
    }

    pub fn nmap_slots_in_use(&self) -> u32 {
        self.nmap_slots_used.load(Ordering::SeqCst)
    }

    /// 获取PT租约。别的持有者的未过期租约存在时返回
    /// `ConcurrencyConflict`，本轮跳过该PT。
    pub fn acquire_lease(
        &self,
        pt_id: i64,
        record: &mut PtRecord,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        if !record.lease_available(&self.identity.owner, now) {
            let owner = record.lock_owner.clone().unwrap_or_default();
            return Err(OrchestratorError::ConcurrencyConflict { pt_id, owner });
        }
        record.lock_owner = Some(self.identity.owner.clone());
        record.lock_until = Some(now + Duration::minutes(self.limits.pt_lock_ttl_minutes));
        Ok(())
    }

    pub fn release_lease(&self, record: &mut PtRecord) {
        if record.lock_owner.as_deref() == Some(self.identity.owner.as_str()) {
            record.lock_owner = None;
            record.lock_until = None;
        }
    }

    /// 子域名阶段卡死判定：running态停留超过阈值
    pub fn is_stuck(&self, record: &PtRecord, now: DateTime<Utc>) -> bool {
        record.state == PtState::SubdomainsRunning
            && now - record.last_update
                > Duration::minutes(self.limits.subdomains_running_timeout_minutes)
    }

    /// 卡死的PT无视锁强制置error，保证worker崩溃后的活性。
    /// 残留的running计数视为已死任务，归还对应槽位。
    pub fn force_error_if_stuck(&self, record: &mut PtRecord, now: DateTime<Utc>) -> bool {
        if !self.is_stuck(record, now) {
            return false;
        }
        let orphaned = record.subdomains.running;
        self.release_subdomain_slots(orphaned);
        record.subdomains.running = 0;
        // 持锁的那轮已经死了，租约一并清掉
        record.lock_owner = None;
        record.lock_until = None;
        record.record_failure(
            orchestrator_domain::entities::Stage::Subdomains,
            &format!(
                "subdomains_running 超时（超过 {} 分钟无进展），强制失败",
                self.limits.subdomains_running_timeout_minutes
            ),
            now,
        );
        warn!(
            "PT卡死强制置error: 回收 {} 个残留子域名槽位",
            orphaned
        );
        true
    }
}
