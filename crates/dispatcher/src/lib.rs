//! 编排器核心逻辑
//!
//! 准入控制、重试策略、节点池分发与编排轮次都在这个crate里，
//! 对外只依赖domain层的端口trait，不接触任何具体的HTTP实现。

pub mod admission;
pub mod node_pool;
pub mod pass;
pub mod retry_policy;
pub mod strategies;

pub use admission::{AdmissionController, PassIdentity};
pub use node_pool::{DispatchRoundResult, NodePoolDispatcher, ProbeReport, TargetDispatch};
pub use pass::{OrchestrationPass, PassSummary, StageExecutors};
pub use retry_policy::RetryPolicy;
pub use strategies::SelectionPolicy;
