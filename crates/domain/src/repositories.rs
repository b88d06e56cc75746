//! 外部协作方端口定义
//!
//! 编排器通过这些trait与记录源、扫描节点、阶段执行器和粘性分配表
//! 交互，具体实现在infrastructure层。

use async_trait::async_trait;

use orchestrator_core::OrchestratorResult;

use crate::entities::{DispatchItem, PtSummary, ScanNode, ScanTarget, StageOutcome};

/// 系统记录源（Dojo）里的PT读写
#[async_trait]
pub trait ProductTypeStore: Send + Sync {
    /// 取本轮窗口内的PT（按id升序，最多limit个）
    async fn list_window(&self, limit: usize) -> OrchestratorResult<Vec<PtSummary>>;

    /// 读取单个PT的自由文本字段原文
    async fn get_raw(&self, pt_id: i64) -> OrchestratorResult<String>;

    /// 写回自由文本字段。调用方必须持有该PT的租约。
    async fn update_raw(&self, pt_id: i64, raw: &str) -> OrchestratorResult<()>;
}

/// 粘性分配表: pt_id -> 节点名，跨轮持久
#[async_trait]
pub trait StickyAssignmentStore: Send + Sync {
    async fn get(&self, pt_id: i64) -> OrchestratorResult<Option<String>>;

    async fn set(&self, pt_id: i64, node_name: &str) -> OrchestratorResult<()>;

    async fn remove(&self, pt_id: i64) -> OrchestratorResult<()>;
}

/// 扫描后端单节点的HTTP面
#[async_trait]
pub trait ScanNodeClient: Send + Sync {
    /// 健康探测。返回Err即视为不健康。
    async fn health(&self, node: &ScanNode) -> OrchestratorResult<()>;

    /// 当前活跃扫描会话数
    async fn active_sessions(&self, node: &ScanNode) -> OrchestratorResult<u32>;

    /// 启动一次扫描，返回后端的任务标识
    async fn start_scan(&self, node: &ScanNode, target: &ScanTarget) -> OrchestratorResult<String>;
}

/// 不透明的阶段执行器：接受分发单元，返回成败与阶段计数
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// 执行一个分发单元。payload声明的stage与执行器服务的阶段
    /// 不一致时必须拒绝而不是执行。
    async fn execute(&self, item: &DispatchItem) -> OrchestratorResult<StageOutcome>;
}

/// targets阶段产出的目标清单读取口
#[async_trait]
pub trait TargetListStore: Send + Sync {
    /// 某PT当前待扫描的目标（已扣除既往已分发部分）
    async fn pending_targets(&self, pt_id: i64) -> OrchestratorResult<Vec<ScanTarget>>;

    /// 标记一个目标已成功分发
    async fn mark_dispatched(&self, pt_id: i64, target: &ScanTarget) -> OrchestratorResult<()>;
}
