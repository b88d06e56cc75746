//! PT状态机
//!
//! 迁移表是显式数据：事件 → (合法起点集合, 目标状态, 守卫)。
//! 守卫只依赖记录本身（屏障、计数一致性）；槽位之类的全局准入
//! 条件由准入控制器在触发事件之前把关。

use chrono::{DateTime, Utc};

use orchestrator_core::{OrchestratorError, OrchestratorResult};

use crate::entities::{DispatchPolicySnapshot, PtRecord, PtState, Stage};

/// 状态机事件
#[derive(Debug, Clone, PartialEq)]
pub enum PtEvent {
    /// 准入子域名枚举（首次或继续扇出）
    AdmitSubdomains,
    /// 子域名扇出全部到达终态
    SubdomainsBarrierReached,
    /// 准入nmap阶段
    AdmitNmap,
    /// nmap阶段成功结束
    NmapFinished,
    /// targets阶段成功产出目标清单
    TargetsPrepared,
    /// 准入扫描阶段，在此边记录策略快照
    AdmitAcu { policy: DispatchPolicySnapshot },
    /// 扫描、报告、导入全部完成
    AcuFinished,
    /// 阶段执行失败
    StageFailed { stage: Stage, message: String },
}

impl PtEvent {
    fn name(&self) -> &'static str {
        match self {
            PtEvent::AdmitSubdomains => "admit_subdomains",
            PtEvent::SubdomainsBarrierReached => "subdomains_barrier_reached",
            PtEvent::AdmitNmap => "admit_nmap",
            PtEvent::NmapFinished => "nmap_finished",
            PtEvent::TargetsPrepared => "targets_prepared",
            PtEvent::AdmitAcu { .. } => "admit_acu",
            PtEvent::AcuFinished => "acu_finished",
            PtEvent::StageFailed { .. } => "stage_failed",
        }
    }
}

/// 一条迁移边：合法起点、目标状态、记录级守卫
struct Edge {
    from: &'static [PtState],
    to: PtState,
    guard: fn(&PtRecord) -> Result<(), String>,
}

fn no_guard(_: &PtRecord) -> Result<(), String> {
    Ok(())
}

/// error态的再准入必须回到上次失败的阶段，保证各阶段重试上限可达
fn error_resume_check(record: &PtRecord, expected: Stage) -> Result<(), String> {
    if record.state != PtState::Error {
        return Ok(());
    }
    match record.last_stage {
        // 没有失败历史的error态（例如人工置位）从头进入流水线
        None if expected == Stage::Subdomains => Ok(()),
        Some(stage) if stage == expected => Ok(()),
        other => Err(format!(
            "error态的再准入必须回到失败阶段 {:?}，而不是 {}",
            other.map(|s| s.as_str()),
            expected
        )),
    }
}

fn resume_subdomains_guard(record: &PtRecord) -> Result<(), String> {
    error_resume_check(record, Stage::Subdomains)
}

fn resume_nmap_guard(record: &PtRecord) -> Result<(), String> {
    error_resume_check(record, Stage::Nmap)
}

fn resume_targets_guard(record: &PtRecord) -> Result<(), String> {
    error_resume_check(record, Stage::Targets)
}

fn resume_acu_guard(record: &PtRecord) -> Result<(), String> {
    error_resume_check(record, Stage::Acu)
}

fn barrier_guard(record: &PtRecord) -> Result<(), String> {
    if !record.subdomains.is_consistent() {
        return Err(format!(
            "子域名计数不一致: done={} failed={} running={} total={}",
            record.subdomains.done,
            record.subdomains.failed,
            record.subdomains.running,
            record.subdomains.total
        ));
    }
    if !record.subdomains.barrier_reached() {
        return Err(format!(
            "完成屏障未达成: done={} failed={} running={} total={}",
            record.subdomains.done,
            record.subdomains.failed,
            record.subdomains.running,
            record.subdomains.total
        ));
    }
    Ok(())
}

fn edge_for(event: &PtEvent) -> Edge {
    match event {
        PtEvent::AdmitSubdomains => Edge {
            from: &[PtState::New, PtState::Error, PtState::SubdomainsRunning],
            to: PtState::SubdomainsRunning,
            guard: resume_subdomains_guard,
        },
        PtEvent::SubdomainsBarrierReached => Edge {
            from: &[PtState::SubdomainsRunning],
            to: PtState::SubdomainsDone,
            guard: barrier_guard,
        },
        PtEvent::AdmitNmap => Edge {
            from: &[PtState::SubdomainsDone, PtState::NmapRunning, PtState::Error],
            to: PtState::NmapRunning,
            guard: resume_nmap_guard,
        },
        PtEvent::NmapFinished => Edge {
            from: &[PtState::NmapRunning],
            to: PtState::NmapDone,
            guard: no_guard,
        },
        PtEvent::TargetsPrepared => Edge {
            from: &[PtState::NmapDone, PtState::Error],
            to: PtState::TargetsReady,
            guard: resume_targets_guard,
        },
        PtEvent::AdmitAcu { .. } => Edge {
            from: &[PtState::TargetsReady, PtState::Error],
            to: PtState::AcuRunning,
            guard: resume_acu_guard,
        },
        PtEvent::AcuFinished => Edge {
            from: &[PtState::AcuRunning],
            to: PtState::Done,
            guard: no_guard,
        },
        PtEvent::StageFailed { .. } => Edge {
            from: &[
                PtState::New,
                PtState::SubdomainsRunning,
                PtState::SubdomainsDone,
                PtState::NmapRunning,
                PtState::NmapDone,
                PtState::TargetsReady,
                PtState::AcuRunning,
                PtState::Error,
            ],
            to: PtState::Error,
            guard: no_guard,
        },
    }
}

/// 应用一个事件。成功时返回新状态并更新记录；
/// 事件与当前状态不匹配时返回 `InvalidTransition`，记录不变。
pub fn apply(
    record: &mut PtRecord,
    event: PtEvent,
    now: DateTime<Utc>,
) -> OrchestratorResult<PtState> {
    let edge = edge_for(&event);

    if !edge.from.contains(&record.state) {
        return Err(OrchestratorError::InvalidTransition(format!(
            "状态 {} 不接受事件 {}",
            record.state,
            event.name()
        )));
    }

    // 失败事件必须与当前状态隐含的阶段一致，防止过期payload串台
    if let PtEvent::StageFailed { stage, .. } = &event {
        match record.implied_stage() {
            Some(implied) if implied == *stage => {}
            implied => {
                return Err(OrchestratorError::InvalidTransition(format!(
                    "失败payload声明阶段 {stage}，但状态 {} 隐含阶段 {:?}",
                    record.state, implied
                )));
            }
        }
    }

    if let Err(reason) = (edge.guard)(record) {
        return Err(OrchestratorError::InvalidTransition(format!(
            "事件 {} 守卫不通过: {reason}",
            event.name()
        )));
    }

    match event {
        PtEvent::StageFailed { stage, message } => {
            record.record_failure(stage, &message, now);
        }
        PtEvent::SubdomainsBarrierReached => {
            record.state = edge.to;
            record.record_success(Stage::Subdomains, now);
        }
        PtEvent::NmapFinished => {
            record.state = edge.to;
            record.record_success(Stage::Nmap, now);
        }
        PtEvent::TargetsPrepared => {
            record.state = edge.to;
            record.record_success(Stage::Targets, now);
        }
        PtEvent::AcuFinished => {
            record.state = edge.to;
            record.record_success(Stage::Acu, now);
        }
        PtEvent::AdmitAcu { policy } => {
            record.state = edge.to;
            record.acu_dispatch_policy = Some(policy);
            record.last_update = now;
        }
        PtEvent::AdmitSubdomains | PtEvent::AdmitNmap => {
            record.state = edge.to;
            record.last_update = now;
        }
    }

    Ok(record.state)
}
