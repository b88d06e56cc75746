//! 扫描节点池配置
//!
//! 节点清单既可以写在TOML里，也可以整块通过 `ACUNETIX_NODES_JSON` 注入。
//! 过渡期遗留别名（`token`/`credential`、`max_scans`/`max_scans_per_node`、
//! `ACU_*`/`ACUNETIX_*`）统一在这里归一化。

use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, OrchestratorResult};

/// 单个扫描节点描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub endpoint: String,
    /// API凭证。遗留节点JSON里叫 `token`
    #[serde(default, alias = "token")]
    pub credential: String,
    /// 每节点容量覆盖，缺省时用全局默认
    #[serde(default, alias = "max_scans")]
    pub max_scans_per_node: Option<u32>,
    /// weighted 策略的选择权重
    #[serde(default)]
    pub weight: Option<u32>,
}

impl NodeEntry {
    pub fn has_credential(&self) -> bool {
        !self.credential.trim().is_empty()
    }
}

/// 节点池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePoolConfig {
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    /// 全局默认每节点最大并发扫描数
    pub default_max_scans_per_node: u32,
    /// 选择策略: least_loaded | weighted
    pub selection_policy: String,
    /// 是否启用粘性分配
    pub sticky_assignment: bool,
    /// 单节点健康探测超时（秒）
    pub probe_timeout_seconds: u64,
    /// 粘性分配表的持久化路径
    pub sticky_map_path: String,
}

impl Default for NodePoolConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            default_max_scans_per_node: 5,
            selection_policy: "least_loaded".to_string(),
            sticky_assignment: true,
            probe_timeout_seconds: 10,
            sticky_map_path: "/tmp/orchestrator_sticky_map.json".to_string(),
        }
    }
}

impl NodePoolConfig {
    /// 节点的生效容量：节点覆盖值优先于全局默认
    pub fn effective_max_scans(&self, entry: &NodeEntry) -> u32 {
        entry.max_scans_per_node.unwrap_or(self.default_max_scans_per_node)
    }

    /// 回填遗留环境变量别名
    pub fn apply_legacy_env<F>(&mut self, get: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|k| get(k))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        // 整块注入的节点清单只在配置未给出任何节点时生效
        if self.nodes.is_empty() {
            if let Some(raw) = first(&["ACUNETIX_NODES_JSON"]) {
                if let Ok(parsed) = serde_json::from_str::<Vec<NodeEntry>>(&raw) {
                    self.nodes = parsed;
                }
            }
        }

        // 仍然没有节点时，允许单节点的遗留端点/凭证变量拼出一个默认节点
        if self.nodes.is_empty() {
            let endpoint = first(&["ACUNETIX_BASE_URL", "ACU_BASE_URL"]);
            let credential = first(&["ACUNETIX_API_KEY", "ACU_API_TOKEN"]);
            if let (Some(endpoint), Some(credential)) = (endpoint, credential) {
                self.nodes.push(NodeEntry {
                    name: "default".to_string(),
                    endpoint,
                    credential,
                    max_scans_per_node: None,
                    weight: None,
                });
            }
        } else {
            // 凭证缺失的条目可由全局遗留凭证补齐
            if let Some(credential) = first(&["ACUNETIX_API_KEY", "ACU_API_TOKEN"]) {
                for node in self.nodes.iter_mut().filter(|n| !n.has_credential()) {
                    node.credential = credential.clone();
                }
            }
        }

        if let Some(n) = first(&["ACUNETIX_MAX_SCANS_PER_NODE"]).and_then(|v| v.parse().ok()) {
            self.default_max_scans_per_node = n;
        }
        if let Some(policy) = first(&["ACUNETIX_NODE_SELECTION"]) {
            self.selection_policy = policy;
        }
        if let Some(v) = first(&["ACUNETIX_STICKY_ASSIGNMENT"]) {
            self.sticky_assignment =
                matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on");
        }
    }

    /// 分发步骤开始前的致命校验：节点清单可用且至少带一个可用凭证。
    /// 不满足时整个分发步骤中止，绝不带空凭证发请求。
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.nodes.is_empty() {
            return Err(OrchestratorError::Configuration(
                "节点池为空：未配置任何扫描节点".to_string(),
            ));
        }
        if !self.nodes.iter().any(|n| n.has_credential()) {
            return Err(OrchestratorError::Configuration(
                "所有节点都缺少可用凭证".to_string(),
            ));
        }
        for node in &self.nodes {
            if node.name.trim().is_empty() || node.endpoint.trim().is_empty() {
                return Err(OrchestratorError::Configuration(format!(
                    "节点描述不完整: name={:?} endpoint={:?}",
                    node.name, node.endpoint
                )));
            }
        }
        match self.selection_policy.as_str() {
            "least_loaded" | "weighted" => {}
            other => {
                return Err(OrchestratorError::Configuration(format!(
                    "未知的节点选择策略: {other}"
                )));
            }
        }
        Ok(())
    }
}
