//! 编排轮次
//!
//! 每个调度tick跑一轮：加载PT窗口 → 解码状态 → 冻结/卡死/租约
//! 门控 → 推进守卫成立的状态机边 → 扫描阶段走节点池分发 → 编码
//! 写回。窗口内的PT在有界并发下独立处理，单个PT的任何失败都不
//! 影响其余PT；全局共享的只有槽位账本和节点池。
//!
//! 扫描阶段的分发需要跨PT的公平队列，所以拆成两段：A段并发推进
//! 各PT至多到targets_ready/acu_running，把待扫目标带租约收集起来；
//! B段在单写者语义下跑节点池的交织队列。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use orchestrator_core::{AppConfig, OrchestratorResult};
use orchestrator_domain::entities::{
    DiagEvent, DispatchItem, JobMetadata, PtRecord, PtState, PtSummary, ScanTarget, Stage,
    StageOutcome,
};
use orchestrator_domain::repositories::{
    ProductTypeStore, ScanNodeClient, StageExecutor, StickyAssignmentStore, TargetListStore,
};
use orchestrator_domain::state_codec;
use orchestrator_domain::state_machine::{self, PtEvent};

use crate::admission::{AdmissionController, PassIdentity};
use crate::node_pool::{NodePoolDispatcher, TargetDispatch};
use crate::retry_policy::RetryPolicy;

/// 四个阶段执行器的集合
#[derive(Clone)]
pub struct StageExecutors {
    pub subdomains: Arc<dyn StageExecutor>,
    pub nmap: Arc<dyn StageExecutor>,
    pub targets: Arc<dyn StageExecutor>,
    pub acu: Arc<dyn StageExecutor>,
}

impl StageExecutors {
    fn for_stage(&self, stage: Stage) -> &Arc<dyn StageExecutor> {
        match stage {
            Stage::Subdomains => &self.subdomains,
            Stage::Nmap => &self.nmap,
            Stage::Targets => &self.targets,
            Stage::Acu => &self.acu,
        }
    }
}

/// 一轮的汇总结果
#[derive(Debug, Default)]
pub struct PassSummary {
    pub considered: usize,
    pub corrupt: usize,
    pub conflicts: usize,
    pub frozen: usize,
    pub stuck_forced: usize,
    /// 本轮成功应用的状态迁移总数
    pub advanced: usize,
    pub failures: usize,
    pub scans_dispatched: usize,
    pub scans_deferred: usize,
    pub persist_errors: usize,
    /// 节点池配置致命错误（仅中止分发步骤，不影响其他阶段）
    pub dispatch_config_error: Option<String>,
    pub dispatch_items: Vec<DispatchItem>,
    pub events: Vec<DiagEvent>,
}

/// A段结束后仍持有租约、等待B段分发的PT
struct AcuCandidate {
    pt: PtSummary,
    record: PtRecord,
    raw: String,
    pending: Vec<ScanTarget>,
}

/// 单个PT在A段的处理结果
#[derive(Default)]
struct PtProcessed {
    events: Vec<DiagEvent>,
    advanced: usize,
    failed: bool,
    corrupt: bool,
    conflict: bool,
    frozen: bool,
    stuck_forced: bool,
    persist_error: bool,
    candidate: Option<AcuCandidate>,
}

/// 一个阶段步骤的走向
enum StepResult {
    /// 状态前进了，继续推进下一条边
    Continue,
    /// 本轮到此为止
    Break,
    /// 容量不足，延后到下一轮
    Defer,
    /// 阶段失败已登记
    Fail,
    /// 进入B段的扫描分发队列
    Candidate(Vec<ScanTarget>),
}

pub struct OrchestrationPass {
    config: AppConfig,
    store: Arc<dyn ProductTypeStore>,
    sticky: Arc<dyn StickyAssignmentStore>,
    node_client: Arc<dyn ScanNodeClient>,
    target_lists: Arc<dyn TargetListStore>,
    executors: StageExecutors,
}

impl OrchestrationPass {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ProductTypeStore>,
        sticky: Arc<dyn StickyAssignmentStore>,
        node_client: Arc<dyn ScanNodeClient>,
        target_lists: Arc<dyn TargetListStore>,
        executors: StageExecutors,
    ) -> Self {
        Self {
            config,
            store,
            sticky,
            node_client,
            target_lists,
            executors,
        }
    }

    /// 跑一整轮
    pub async fn run(&self) -> OrchestratorResult<PassSummary> {
        let identity = PassIdentity::generate();
        self.run_as(identity).await
    }

    /// 以指定身份跑一轮（测试与诊断用）
    pub async fn run_as(&self, identity: PassIdentity) -> OrchestratorResult<PassSummary> {
        let started = Instant::now();
        let admission = Arc::new(AdmissionController::new(
            self.config.limits.clone(),
            identity,
        ));
        let retry = Arc::new(RetryPolicy::new(self.config.retry.clone()));
        let mut summary = PassSummary::default();

        let window = self
            .store
            .list_window(self.config.limits.pt_window_size)
            .await?;
        summary.considered = window.len();
        info!("本轮窗口加载了 {} 个PT", window.len());

        // 预解码整个窗口用于账本播种；损坏的PT在这里出局
        let now = Utc::now();
        let mut decoded: Vec<(PtSummary, PtRecord)> = Vec::with_capacity(window.len());
        for pt in window {
            match state_codec::decode(pt.id, &pt.description) {
                Ok(Some(record)) => decoded.push((pt, record)),
                Ok(None) => decoded.push((pt, PtRecord::new_at(now))),
                Err(e) => {
                    warn!("跳过损坏的PT {}: {e}", pt.id);
                    summary.corrupt += 1;
                    summary
                        .events
                        .push(DiagEvent::error(Some(pt.id), "state", "decode", ""));
                }
            }
        }
        let records: Vec<PtRecord> = decoded.iter().map(|(_, r)| r.clone()).collect();
        admission.seed_from_window(&records);

        // A段：有界并发的逐PT推进
        let results: Vec<PtProcessed> = stream::iter(decoded)
            .map(|(pt, _)| {
                let admission = Arc::clone(&admission);
                let retry = Arc::clone(&retry);
                async move { self.process_pt(pt, &admission, &retry).await }
            })
            .buffer_unordered(self.config.limits.pass_parallelism)
            .collect()
            .await;

        let mut candidates = Vec::new();
        for mut processed in results {
            summary.events.append(&mut processed.events);
            summary.advanced += processed.advanced;
            summary.failures += usize::from(processed.failed);
            summary.corrupt += usize::from(processed.corrupt);
            summary.conflicts += usize::from(processed.conflict);
            summary.frozen += usize::from(processed.frozen);
            summary.stuck_forced += usize::from(processed.stuck_forced);
            summary.persist_errors += usize::from(processed.persist_error);
            if let Some(candidate) = processed.candidate {
                candidates.push(candidate);
            }
        }

        // B段：扫描阶段的节点池分发
        if !candidates.is_empty() {
            self.dispatch_scans(candidates, &admission, &mut summary)
                .await;
        }

        info!(
            "本轮结束: considered={} advanced={} failures={} dispatched={} deferred={} \
             conflicts={} frozen={} corrupt={} 用时{}ms",
            summary.considered,
            summary.advanced,
            summary.failures,
            summary.scans_dispatched,
            summary.scans_deferred,
            summary.conflicts,
            summary.frozen,
            summary.corrupt,
            started.elapsed().as_millis()
        );
        Ok(summary)
    }

    /// A段中单个PT的完整处理。任何错误都被隔离在该PT内。
    async fn process_pt(
        &self,
        pt: PtSummary,
        admission: &AdmissionController,
        retry: &RetryPolicy,
    ) -> PtProcessed {
        let mut out = PtProcessed::default();
        let pt_id = pt.id;
        let now = Utc::now();

        // 写前重读：租约校验必须基于最新文本
        let raw = match self.store.get_raw(pt_id).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("读取PT {} 失败，本轮跳过: {e}", pt_id);
                out.events
                    .push(DiagEvent::error(Some(pt_id), "state", "read", ""));
                return out;
            }
        };
        let mut record = match state_codec::decode(pt_id, &raw) {
            Ok(Some(record)) => record,
            Ok(None) => PtRecord::new_at(now),
            Err(e) => {
                warn!("PT {} 状态块损坏，本轮跳过: {e}", pt_id);
                out.corrupt = true;
                out.events
                    .push(DiagEvent::error(Some(pt_id), "state", "decode", ""));
                return out;
            }
        };

        if record.state == PtState::Done {
            return out;
        }

        // 冻结的PT对诊断可见但不再自动准入
        if retry.is_frozen(&record) {
            debug!(
                "PT {} 已冻结: last_stage={:?} retry_count={} last_error={:?}",
                pt_id, record.last_stage, record.retry_count, record.last_error
            );
            out.frozen = true;
            return out;
        }

        // 卡死检测无视锁，保证worker崩溃后的活性
        if admission.force_error_if_stuck(&mut record, now) {
            out.stuck_forced = true;
            out.events
                .push(DiagEvent::error(Some(pt_id), "subdomains", "stuck", ""));
            match self.persist(pt_id, &mut record, &raw).await {
                Ok(_) => {}
                Err(e) => {
                    error!("写回卡死PT {} 失败: {e}", pt_id);
                    out.persist_error = true;
                }
            }
            return out;
        }

        // 乐观租约
        if let Err(e) = admission.acquire_lease(pt_id, &mut record, now) {
            debug!("PT {} 租约冲突，本轮跳过: {e}", pt_id);
            out.conflict = true;
            return out;
        }
        let mut raw = match self.persist(pt_id, &mut record, &raw).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("PT {} 租约写回失败，本轮跳过: {e}", pt_id);
                out.persist_error = true;
                return out;
            }
        };

        // 沿状态机推进，直到本轮无事可做
        loop {
            let step = match record.state {
                PtState::Done => StepResult::Break,
                PtState::New | PtState::SubdomainsRunning => {
                    self.subdomains_step(&pt, &mut record, admission, &mut raw, &mut out)
                        .await
                }
                PtState::SubdomainsDone | PtState::NmapRunning => {
                    self.nmap_step(&pt, &mut record, admission, &mut raw, &mut out)
                        .await
                }
                PtState::NmapDone => {
                    self.targets_step(&pt, &mut record, admission, &mut out).await
                }
                PtState::TargetsReady => self.acu_entry_step(&pt, &mut record).await,
                PtState::AcuRunning => {
                    self.acu_running_step(&pt, &mut record, admission, &mut out)
                        .await
                }
                PtState::Error => match record.last_stage {
                    None | Some(Stage::Subdomains) => {
                        self.subdomains_step(&pt, &mut record, admission, &mut raw, &mut out)
                            .await
                    }
                    Some(Stage::Nmap) => {
                        self.nmap_step(&pt, &mut record, admission, &mut raw, &mut out)
                            .await
                    }
                    Some(Stage::Targets) => {
                        self.targets_step(&pt, &mut record, admission, &mut out).await
                    }
                    Some(Stage::Acu) => self.acu_entry_step(&pt, &mut record).await,
                },
            };

            match step {
                StepResult::Continue => continue,
                StepResult::Break | StepResult::Defer => break,
                StepResult::Fail => {
                    out.failed = true;
                    break;
                }
                StepResult::Candidate(pending) => {
                    // 租约保持到B段
                    match self.persist(pt_id, &mut record, &raw).await {
                        Ok(raw) => {
                            out.candidate = Some(AcuCandidate {
                                pt,
                                record,
                                raw,
                                pending,
                            });
                        }
                        Err(e) => {
                            error!("PT {} 写回失败: {e}", pt_id);
                            out.persist_error = true;
                        }
                    }
                    return out;
                }
            }
        }

        admission.release_lease(&mut record);
        if let Err(e) = self.persist(pt_id, &mut record, &raw).await {
            error!("PT {} 写回失败: {e}", pt_id);
            out.persist_error = true;
        }
        out
    }

    /// 子域名阶段：准入/继续扇出，合并执行器上报的进度快照，
    /// 屏障达成时收口
    async fn subdomains_step(
        &self,
        pt: &PtSummary,
        record: &mut PtRecord,
        admission: &AdmissionController,
        raw: &mut String,
        out: &mut PtProcessed,
    ) -> StepResult {
        let now = Utc::now();
        let pt_id = pt.id;

        // total==0 表示扇出计划还没上报过，屏障的平凡成立不算数
        if record.state == PtState::SubdomainsRunning
            && record.subdomains.total > 0
            && record.subdomains.barrier_reached()
        {
            match state_machine::apply(record, PtEvent::SubdomainsBarrierReached, now) {
                Ok(_) => {
                    info!("PT {} 子域名扇出完成屏障达成", pt_id);
                    out.advanced += 1;
                    return StepResult::Continue;
                }
                Err(e) => {
                    warn!("PT {} 屏障收口失败: {e}", pt_id);
                    return StepResult::Break;
                }
            }
        }

        let before = record.subdomains;
        let want = if before.total == 0 {
            self.config.limits.subdomains_concurrency
        } else {
            before.remaining()
        };
        let grant = admission.try_acquire_subdomain_slots(want);

        let entering = record.state != PtState::SubdomainsRunning;
        if entering {
            // 扇出早已全部终结的error态：零槽位重admit后直接收口
            if want == 0 && before.total > 0 && before.barrier_reached() {
                if let Err(e) = state_machine::apply(record, PtEvent::AdmitSubdomains, now) {
                    warn!("PT {} 子域名准入被拒: {e}", pt_id);
                    return StepResult::Break;
                }
                match state_machine::apply(record, PtEvent::SubdomainsBarrierReached, now) {
                    Ok(_) => {
                        out.advanced += 2;
                        return StepResult::Continue;
                    }
                    Err(e) => {
                        warn!("PT {} 屏障收口失败: {e}", pt_id);
                        return StepResult::Break;
                    }
                }
            }
            if grant == 0 {
                debug!("PT {} 子域名槽位耗尽，延后准入", pt_id);
                return StepResult::Defer;
            }
            if let Err(e) = state_machine::apply(record, PtEvent::AdmitSubdomains, now) {
                admission.release_subdomain_slots(grant);
                warn!("PT {} 子域名准入被拒: {e}", pt_id);
                return StepResult::Break;
            }
            out.advanced += 1;
            // 先落准入态，崩溃后下一轮才能观察到running
            match self.persist(pt_id, record, raw).await {
                Ok(updated) => *raw = updated,
                Err(e) => {
                    admission.release_subdomain_slots(grant);
                    error!("PT {} 准入态写回失败: {e}", pt_id);
                    out.persist_error = true;
                    return StepResult::Break;
                }
            }
        } else if want == 0 && before.running == 0 {
            // total>0 且无剩余无在途，屏障分支已处理；到这里说明计数异常
            return StepResult::Break;
        }

        if grant > 0 {
            record.counters.bump(Stage::Subdomains);
        }

        let outcome = self
            .invoke_executor(Stage::Subdomains, pt, record, admission, Some(grant), out)
            .await;

        if !outcome.success {
            admission.release_subdomain_slots(grant);
            let message = outcome
                .message
                .unwrap_or_else(|| "subdomains executor failed".to_string());
            return self.fail_stage(pt_id, record, Stage::Subdomains, &message);
        }

        let snapshot_reported = outcome.subdomains.is_some();
        let after = match outcome.subdomains {
            Some(progress) if !progress.is_consistent() => {
                admission.release_subdomain_slots(grant);
                let message = format!(
                    "执行器上报的子域名计数不一致: done={} failed={} running={} total={}",
                    progress.done, progress.failed, progress.running, progress.total
                );
                return self.fail_stage(pt_id, record, Stage::Subdomains, &message);
            }
            Some(progress) => progress,
            None => before,
        };

        // 账本对账：净增的running占用授予的槽位，其余归还
        let delta = i64::from(after.running) - i64::from(before.running);
        if delta >= 0 {
            let used = delta as u32;
            if used > grant {
                warn!(
                    "PT {} 执行器超出槽位预算: granted={} used={}，下一轮播种时校正",
                    pt_id, grant, used
                );
            }
            admission.release_subdomain_slots(grant.saturating_sub(used));
        } else {
            admission.release_subdomain_slots(grant + delta.unsigned_abs() as u32);
        }
        record.subdomains = after;

        // 屏障只在有过真实上报（本次或历史）时才有意义
        if (snapshot_reported || record.subdomains.total > 0) && record.subdomains.barrier_reached()
        {
            match state_machine::apply(record, PtEvent::SubdomainsBarrierReached, now) {
                Ok(_) => {
                    info!("PT {} 子域名扇出完成屏障达成", pt_id);
                    out.advanced += 1;
                    StepResult::Continue
                }
                Err(e) => {
                    warn!("PT {} 屏障收口失败: {e}", pt_id);
                    StepResult::Break
                }
            }
        } else {
            StepResult::Break
        }
    }

    /// nmap阶段：槽位准入 → 执行 → 成功即nmap_done
    async fn nmap_step(
        &self,
        pt: &PtSummary,
        record: &mut PtRecord,
        admission: &AdmissionController,
        raw: &mut String,
        out: &mut PtProcessed,
    ) -> StepResult {
        let now = Utc::now();
        let pt_id = pt.id;

        // 轮次开始时已是nmap_running的PT在播种时占了槽，不再申请
        let seeded = record.state == PtState::NmapRunning;
        if !seeded && !admission.try_acquire_nmap_slot() {
            debug!("PT {} nmap槽位耗尽，延后准入", pt_id);
            return StepResult::Defer;
        }

        if let Err(e) = state_machine::apply(record, PtEvent::AdmitNmap, now) {
            if !seeded {
                admission.release_nmap_slot();
            }
            warn!("PT {} nmap准入被拒: {e}", pt_id);
            return StepResult::Break;
        }
        if !seeded {
            out.advanced += 1;
        }
        record.counters.bump(Stage::Nmap);

        match self.persist(pt_id, record, raw).await {
            Ok(updated) => *raw = updated,
            Err(e) => {
                // 播种来的槽位对应的外部任务可能还活着，只退本轮新申请的
                if !seeded {
                    admission.release_nmap_slot();
                }
                error!("PT {} nmap准入态写回失败: {e}", pt_id);
                out.persist_error = true;
                return StepResult::Break;
            }
        }

        let outcome = self
            .invoke_executor(Stage::Nmap, pt, record, admission, Some(1), out)
            .await;
        admission.release_nmap_slot();

        if outcome.success {
            match state_machine::apply(record, PtEvent::NmapFinished, now) {
                Ok(_) => {
                    info!("PT {} nmap阶段完成", pt_id);
                    out.advanced += 1;
                    StepResult::Continue
                }
                Err(e) => {
                    warn!("PT {} nmap收口失败: {e}", pt_id);
                    StepResult::Break
                }
            }
        } else {
            let message = outcome
                .message
                .unwrap_or_else(|| "nmap executor failed".to_string());
            self.fail_stage(pt_id, record, Stage::Nmap, &message)
        }
    }

    /// targets阶段：成功即targets_ready，无全局槽位
    async fn targets_step(
        &self,
        pt: &PtSummary,
        record: &mut PtRecord,
        admission: &AdmissionController,
        out: &mut PtProcessed,
    ) -> StepResult {
        let now = Utc::now();
        let pt_id = pt.id;
        record.counters.bump(Stage::Targets);

        let outcome = self
            .invoke_executor(Stage::Targets, pt, record, admission, None, out)
            .await;

        if outcome.success {
            match state_machine::apply(record, PtEvent::TargetsPrepared, now) {
                Ok(_) => {
                    info!("PT {} 目标清单就绪", pt_id);
                    out.advanced += 1;
                    StepResult::Continue
                }
                Err(e) => {
                    warn!("PT {} targets收口失败: {e}", pt_id);
                    StepResult::Break
                }
            }
        } else {
            let message = outcome
                .message
                .unwrap_or_else(|| "targets executor failed".to_string());
            self.fail_stage(pt_id, record, Stage::Targets, &message)
        }
    }

    /// targets_ready（或acu失败重试）：收集待扫目标进B段队列
    async fn acu_entry_step(
        &self,
        pt: &PtSummary,
        record: &mut PtRecord,
    ) -> StepResult {
        let pt_id = pt.id;
        let pending = match self.target_lists.pending_targets(pt_id).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("读取PT {} 目标清单失败: {e}", pt_id);
                return self.fail_stage(
                    pt_id,
                    record,
                    Stage::Acu,
                    &format!("读取目标清单失败: {e}"),
                );
            }
        };

        if pending.is_empty() {
            // targets阶段成功却无可扫目标，按阶段失败暴露给运维
            return self.fail_stage(
                pt_id,
                record,
                Stage::Acu,
                "no_internet_accessible_targets",
            );
        }

        debug!("PT {} 带 {} 个待扫目标进入分发队列", pt_id, pending.len());
        StepResult::Candidate(pending)
    }

    /// acu_running：还有未分发目标就继续排队，否则做完成检查
    async fn acu_running_step(
        &self,
        pt: &PtSummary,
        record: &mut PtRecord,
        admission: &AdmissionController,
        out: &mut PtProcessed,
    ) -> StepResult {
        let now = Utc::now();
        let pt_id = pt.id;

        let pending = match self.target_lists.pending_targets(pt_id).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("读取PT {} 目标清单失败: {e}", pt_id);
                return StepResult::Break;
            }
        };
        if !pending.is_empty() {
            debug!("PT {} 还有 {} 个目标待分发", pt_id, pending.len());
            return StepResult::Candidate(pending);
        }

        let outcome = self
            .invoke_executor(Stage::Acu, pt, record, admission, None, out)
            .await;

        if outcome.success {
            match state_machine::apply(record, PtEvent::AcuFinished, now) {
                Ok(_) => {
                    info!("PT {} 扫描、报告、导入全部完成", pt_id);
                    out.advanced += 1;
                    StepResult::Break
                }
                Err(e) => {
                    warn!("PT {} acu收口失败: {e}", pt_id);
                    StepResult::Break
                }
            }
        } else if outcome.pending {
            debug!("PT {} 扫描仍在进行", pt_id);
            StepResult::Break
        } else {
            let message = outcome
                .message
                .unwrap_or_else(|| "acu stage failed".to_string());
            self.fail_stage(pt_id, record, Stage::Acu, &message)
        }
    }

    /// B段：节点池分发。配置类错误在这里中止整个分发步骤并释放
    /// 候选PT的租约；其余错误按PT隔离。
    async fn dispatch_scans(
        &self,
        mut candidates: Vec<AcuCandidate>,
        admission: &AdmissionController,
        summary: &mut PassSummary,
    ) {
        let pool = match NodePoolDispatcher::new(
            self.config.node_pool.clone(),
            Arc::clone(&self.node_client),
            Arc::clone(&self.sticky),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                error!("节点池配置错误，分发步骤中止: {e}");
                summary.dispatch_config_error = Some(e.to_string());
                for candidate in candidates.iter_mut() {
                    admission.release_lease(&mut candidate.record);
                    if let Err(e) = self
                        .persist(candidate.pt.id, &mut candidate.record, &candidate.raw)
                        .await
                    {
                        error!("PT {} 写回失败: {e}", candidate.pt.id);
                        summary.persist_errors += 1;
                    }
                }
                return;
            }
        };

        let mut probe = pool.probe().await;
        summary.events.append(&mut probe.events);

        let eligible: Vec<(i64, Vec<ScanTarget>)> = candidates
            .iter()
            .map(|c| (c.pt.id, c.pending.clone()))
            .collect();
        let queue = NodePoolDispatcher::build_queue(&eligible);
        info!(
            "扫描分发队列: {} 个PT共 {} 个目标, 空闲槽位 {}",
            eligible.len(),
            queue.len(),
            probe.total_free_slots()
        );

        let mut round = pool.dispatch_round(&mut probe.nodes, &queue).await;
        summary.events.append(&mut round.events);
        summary.scans_dispatched += round.dispatched.len();
        summary.scans_deferred += round.deferred as usize;

        for dispatch in &round.dispatched {
            if let Err(e) = self
                .target_lists
                .mark_dispatched(dispatch.pt_id, &dispatch.target)
                .await
            {
                warn!(
                    "标记PT {} 目标 {} 已分发失败: {e}",
                    dispatch.pt_id, dispatch.target.url
                );
            }
        }

        let now = Utc::now();
        for candidate in candidates.iter_mut() {
            let pt_id = candidate.pt.id;
            let mine: Vec<&TargetDispatch> = round
                .dispatched
                .iter()
                .filter(|d| d.pt_id == pt_id)
                .collect();
            let my_errors: Vec<&(i64, String)> =
                round.errors.iter().filter(|(id, _)| *id == pt_id).collect();

            if !mine.is_empty() {
                summary.dispatch_items.extend(mine.iter().map(|d| DispatchItem {
                    pt_id,
                    stage: Stage::Acu,
                    job_metadata: JobMetadata {
                        source: "orchestrator".to_string(),
                        queue: Stage::Acu.as_str().to_string(),
                        transition: "admit_acu".to_string(),
                        lock_owner: admission.owner().to_string(),
                        slots: None,
                    },
                    selected_node: Some(d.node_name.clone()),
                    policy: Some(pool.snapshot_for(&mine)),
                    tag_signals: candidate.pt.tags.clone(),
                    target: Some(d.target.clone()),
                }));

                // 首批目标上车时进入acu_running并固化策略快照
                if candidate.record.state != PtState::AcuRunning {
                    let policy = pool.snapshot_for(&mine);
                    match state_machine::apply(
                        &mut candidate.record,
                        PtEvent::AdmitAcu { policy },
                        now,
                    ) {
                        Ok(_) => {
                            candidate.record.counters.bump(Stage::Acu);
                            summary.advanced += 1;
                            info!("PT {} 进入扫描阶段, 分发 {} 个目标", pt_id, mine.len());
                        }
                        Err(e) => warn!("PT {} 扫描准入失败: {e}", pt_id),
                    }
                }
            } else if !my_errors.is_empty() {
                // 一个目标都没上车且出现硬错误
                let message = format!("启动扫描失败: {}", my_errors[0].1);
                let stage_event = PtEvent::StageFailed {
                    stage: Stage::Acu,
                    message,
                };
                match state_machine::apply(&mut candidate.record, stage_event, now) {
                    Ok(_) => summary.failures += 1,
                    Err(e) => warn!("PT {} 失败登记被拒: {e}", pt_id),
                }
            }
            // 纯容量不足：状态不动，下一轮重试

            admission.release_lease(&mut candidate.record);
            if let Err(e) = self.persist(pt_id, &mut candidate.record, &candidate.raw).await {
                error!("PT {} 写回失败: {e}", pt_id);
                summary.persist_errors += 1;
            }
        }
    }

    /// 调一个阶段执行器并记录诊断事件。传输层错误折算成失败结果。
    async fn invoke_executor(
        &self,
        stage: Stage,
        pt: &PtSummary,
        record: &PtRecord,
        admission: &AdmissionController,
        slots: Option<u32>,
        out: &mut PtProcessed,
    ) -> StageOutcome {
        let item = DispatchItem {
            pt_id: pt.id,
            stage,
            job_metadata: JobMetadata {
                source: "orchestrator".to_string(),
                queue: stage.as_str().to_string(),
                transition: format!("{}:{}", record.state, stage),
                lock_owner: admission.owner().to_string(),
                slots,
            },
            selected_node: None,
            policy: record.acu_dispatch_policy.clone(),
            tag_signals: pt.tags.clone(),
            target: None,
        };

        let job_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let outcome = match self.executors.for_stage(stage).execute(&item).await {
            Ok(outcome) => outcome,
            Err(e) => StageOutcome::failed(e.to_string()),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let event = if outcome.success || outcome.pending {
            DiagEvent::ok(Some(pt.id), stage.as_str(), &job_id, "").with_duration(duration_ms)
        } else {
            DiagEvent::error(Some(pt.id), stage.as_str(), &job_id, "").with_duration(duration_ms)
        };
        out.events.push(event);

        outcome
    }

    /// 登记一次阶段失败
    fn fail_stage(
        &self,
        pt_id: i64,
        record: &mut PtRecord,
        stage: Stage,
        message: &str,
    ) -> StepResult {
        let now = Utc::now();
        warn!("PT {} 阶段 {} 失败: {message}", pt_id, stage);
        match state_machine::apply(
            record,
            PtEvent::StageFailed {
                stage,
                message: message.to_string(),
            },
            now,
        ) {
            Ok(_) => StepResult::Fail,
            Err(e) => {
                error!("PT {} 失败登记被拒: {e}", pt_id);
                StepResult::Break
            }
        }
    }

    /// 编码写回。返回写回后的最新文本，供后续增量写使用。
    async fn persist(
        &self,
        pt_id: i64,
        record: &mut PtRecord,
        raw: &str,
    ) -> OrchestratorResult<String> {
        let updated = state_codec::encode_at(record, raw, Utc::now())?;
        self.store.update_raw(pt_id, &updated).await?;
        Ok(updated)
    }
}

impl std::fmt::Debug for OrchestrationPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationPass")
            .field("window", &self.config.limits.pt_window_size)
            .field("parallelism", &self.config.limits.pass_parallelism)
            .finish()
    }
}
