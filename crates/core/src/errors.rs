use thiserror::Error;

/// 编排器错误类型定义
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("PT {pt_id} 状态块损坏: {message}")]
    StateCorruption { pt_id: i64, message: String },

    #[error("PT {pt_id} 的租约被 {owner} 持有")]
    ConcurrencyConflict { pt_id: i64, owner: String },

    #[error("容量不足: {0}")]
    CapacityExhausted(String),

    #[error("阶段执行失败: {0}")]
    StageExecution(String),

    #[error("PT {pt_id} 在阶段 {stage} 的重试次数已达上限 ({count})")]
    RetryLimitExceeded {
        pt_id: i64,
        stage: String,
        count: u32,
    },

    #[error("非法状态迁移: {0}")]
    InvalidTransition(String),

    #[error("PT未找到: {id}")]
    PtNotFound { id: i64 },

    #[error("网络错误: {0}")]
    Network(#[from] reqwest::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// 仅配置类错误会使整个分发步骤中止，其余错误按PT隔离
    pub fn is_fatal_for_dispatch(&self) -> bool {
        matches!(self, OrchestratorError::Configuration(_))
    }

    /// 容量不足属于延后处理，不计入失败
    pub fn is_deferral(&self) -> bool {
        matches!(self, OrchestratorError::CapacityExhausted(_))
    }
}

/// 统一的Result类型
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let config_err = OrchestratorError::Configuration("节点列表为空".to_string());
        assert!(config_err.is_fatal_for_dispatch());
        assert!(!config_err.is_deferral());

        let capacity_err = OrchestratorError::CapacityExhausted("无空闲节点".to_string());
        assert!(!capacity_err.is_fatal_for_dispatch());
        assert!(capacity_err.is_deferral());

        let conflict = OrchestratorError::ConcurrencyConflict {
            pt_id: 7,
            owner: "host:abc".to_string(),
        };
        assert!(!conflict.is_fatal_for_dispatch());
    }
}
