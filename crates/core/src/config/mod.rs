//! 编排器配置管理
//!
//! 配置来源分层：内置默认值 → TOML文件 → `ORCHESTRATOR`前缀环境变量 →
//! 遗留环境变量别名回填。别名归一化只发生在这一层，下游组件看到的
//! 永远是规范化后的配置结构。

mod node_pool;

pub use node_pool::{NodeEntry, NodePoolConfig};

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, OrchestratorResult};

/// Dojo（系统记录源）连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DojoConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout_seconds: u64,
}

/// 全局准入与租约限制
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// 每轮最多考察的PT数量
    pub pt_window_size: usize,
    /// 子域名枚举任务的全局槽位上限
    pub subdomains_concurrency: u32,
    /// nmap任务的全局槽位上限
    pub nmap_concurrency: u32,
    /// PT租约TTL（分钟）
    pub pt_lock_ttl_minutes: i64,
    /// 子域名阶段卡死判定阈值（分钟）
    pub subdomains_running_timeout_minutes: i64,
    /// 单轮内并行处理的PT数量上限
    pub pass_parallelism: usize,
}

/// 各阶段重试上限
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLimits {
    pub subdomains_max: u32,
    pub nmap_max: u32,
    pub targets_max: u32,
    pub acu_max: u32,
}

/// 单个阶段执行器的外部命令配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}

/// 阶段执行器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    pub subdomains: StageCommand,
    pub nmap: StageCommand,
    pub targets: StageCommand,
    /// acu阶段的完成检查（扫描+报告+导入是否全部结束）
    pub acu: StageCommand,
    /// 目标清单工件目录（targets阶段写入，acu阶段读取）
    pub artifact_dir: String,
}

/// 应用配置根
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub dojo: DojoConfig,
    pub limits: LimitsConfig,
    pub retry: RetryLimits,
    pub node_pool: NodePoolConfig,
    pub executors: ExecutorsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dojo: DojoConfig {
                base_url: "http://localhost:8080/api/v2".to_string(),
                api_token: String::new(),
                timeout_seconds: 30,
            },
            limits: LimitsConfig::default(),
            retry: RetryLimits::default(),
            node_pool: NodePoolConfig::default(),
            executors: ExecutorsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            pt_window_size: 20,
            subdomains_concurrency: 10,
            nmap_concurrency: 4,
            pt_lock_ttl_minutes: 30,
            subdomains_running_timeout_minutes: 180,
            pass_parallelism: 8,
        }
    }
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            subdomains_max: 3,
            nmap_max: 3,
            targets_max: 3,
            acu_max: 3,
        }
    }
}

impl Default for ExecutorsConfig {
    fn default() -> Self {
        Self {
            subdomains: StageCommand {
                command: "enum_subs_auto".to_string(),
                args: vec![],
                timeout_seconds: 1800,
            },
            nmap: StageCommand {
                command: "process_nmap_ips_for_pt".to_string(),
                args: vec![],
                timeout_seconds: 3600,
            },
            targets: StageCommand {
                command: "sync_pt_targets".to_string(),
                args: vec![],
                timeout_seconds: 600,
            },
            acu: StageCommand {
                command: "check_acu_pt".to_string(),
                args: vec![],
                timeout_seconds: 300,
            },
            artifact_dir: "/tmp".to_string(),
        }
    }
}

impl AppConfig {
    /// 加载配置：默认值 → TOML文件 → 环境变量 → 遗留别名回填 → 校验
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/orchestrator.toml",
                "orchestrator.toml",
                "/etc/orchestrator/config.toml",
            ];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder
            .set_default("dojo.base_url", "http://localhost:8080/api/v2")?
            .set_default("dojo.api_token", "")?
            .set_default("dojo.timeout_seconds", 30)?
            .set_default("limits.pt_window_size", 20)?
            .set_default("limits.subdomains_concurrency", 10)?
            .set_default("limits.nmap_concurrency", 4)?
            .set_default("limits.pt_lock_ttl_minutes", 30)?
            .set_default("limits.subdomains_running_timeout_minutes", 180)?
            .set_default("limits.pass_parallelism", 8)?
            .set_default("retry.subdomains_max", 3)?
            .set_default("retry.nmap_max", 3)?
            .set_default("retry.targets_max", 3)?
            .set_default("retry.acu_max", 3)?
            .set_default("node_pool.default_max_scans_per_node", 5)?
            .set_default("node_pool.selection_policy", "least_loaded")?
            .set_default("node_pool.sticky_assignment", true)?
            .set_default("node_pool.probe_timeout_seconds", 10)?
            .set_default(
                "node_pool.sticky_map_path",
                "/tmp/orchestrator_sticky_map.json",
            )?
            .set_default("executors.subdomains.command", "enum_subs_auto")?
            .set_default("executors.subdomains.timeout_seconds", 1800)?
            .set_default("executors.nmap.command", "process_nmap_ips_for_pt")?
            .set_default("executors.nmap.timeout_seconds", 3600)?
            .set_default("executors.targets.command", "sync_pt_targets")?
            .set_default("executors.targets.timeout_seconds", 600)?
            .set_default("executors.acu.command", "check_acu_pt")?
            .set_default("executors.acu.timeout_seconds", 300)?
            .set_default("executors.artifact_dir", "/tmp")?;

        builder = builder.add_source(
            Environment::with_prefix("ORCHESTRATOR")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.apply_legacy_env(|key| std::env::var(key).ok());
        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.apply_legacy_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// 回填过渡期遗留环境变量。只在值缺失时生效，显式配置永远优先。
    pub fn apply_legacy_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|k| get(k))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        if self.dojo.api_token.is_empty() {
            if let Some(token) = first(&["DOJO_API_TOKEN"]) {
                self.dojo.api_token = token;
            }
        }
        if let Some(url) = first(&["DOJO_BASE_URL"]) {
            if self.dojo.base_url == "http://localhost:8080/api/v2" {
                self.dojo.base_url = url;
            }
        }

        if let Some(size) = first(&["PT_WINDOW_SIZE"]).and_then(|v| v.parse().ok()) {
            self.limits.pt_window_size = size;
        }
        if let Some(n) = first(&["SUBDOMAINS_CONCURRENCY"]).and_then(|v| v.parse().ok()) {
            self.limits.subdomains_concurrency = n;
        }
        if let Some(n) = first(&["NMAP_CONCURRENCY"]).and_then(|v| v.parse().ok()) {
            self.limits.nmap_concurrency = n;
        }
        if let Some(n) = first(&["PT_LOCK_TTL_MINUTES"]).and_then(|v| v.parse().ok()) {
            self.limits.pt_lock_ttl_minutes = n;
        }
        if let Some(n) =
            first(&["SUBDOMAINS_RUNNING_TIMEOUT_MINUTES"]).and_then(|v| v.parse().ok())
        {
            self.limits.subdomains_running_timeout_minutes = n;
        }

        if let Some(n) = first(&["PT_RETRY_SUBDOMAINS_MAX"]).and_then(|v| v.parse().ok()) {
            self.retry.subdomains_max = n;
        }
        if let Some(n) = first(&["PT_RETRY_NMAP_MAX"]).and_then(|v| v.parse().ok()) {
            self.retry.nmap_max = n;
        }
        if let Some(n) = first(&["PT_RETRY_TARGETS_MAX"]).and_then(|v| v.parse().ok()) {
            self.retry.targets_max = n;
        }
        if let Some(n) = first(&["PT_RETRY_ACU_MAX"]).and_then(|v| v.parse().ok()) {
            self.retry.acu_max = n;
        }

        self.node_pool.apply_legacy_env(&get);
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.dojo.base_url.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "dojo.base_url 不能为空".to_string(),
            ));
        }
        if self.limits.pt_window_size == 0 {
            return Err(OrchestratorError::Configuration(
                "limits.pt_window_size 必须大于0".to_string(),
            ));
        }
        if self.limits.pass_parallelism == 0 {
            return Err(OrchestratorError::Configuration(
                "limits.pass_parallelism 必须大于0".to_string(),
            ));
        }
        if self.limits.pt_lock_ttl_minutes <= 0 {
            return Err(OrchestratorError::Configuration(
                "limits.pt_lock_ttl_minutes 必须大于0".to_string(),
            ));
        }
        // 节点池的致命校验留给分发步骤：池配置坏掉只中止扫描分发，
        // 其余阶段照常推进
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.limits.pt_window_size, 20);
        assert_eq!(config.limits.subdomains_concurrency, 10);
        assert_eq!(config.retry.acu_max, 3);
        assert_eq!(config.node_pool.selection_policy, "least_loaded");
        assert!(config.node_pool.sticky_assignment);
    }

    #[test]
    fn test_legacy_env_backfill() {
        let mut config = AppConfig::default();
        config.apply_legacy_env(env_of(&[
            ("PT_WINDOW_SIZE", "50"),
            ("SUBDOMAINS_CONCURRENCY", "16"),
            ("PT_RETRY_ACU_MAX", "5"),
            ("DOJO_API_TOKEN", "tok-123"),
        ]));

        assert_eq!(config.limits.pt_window_size, 50);
        assert_eq!(config.limits.subdomains_concurrency, 16);
        assert_eq!(config.retry.acu_max, 5);
        assert_eq!(config.dojo.api_token, "tok-123");
    }

    #[test]
    fn test_explicit_value_wins_over_legacy_env() {
        let mut config = AppConfig::default();
        config.dojo.api_token = "explicit".to_string();
        config.apply_legacy_env(env_of(&[("DOJO_API_TOKEN", "legacy")]));
        assert_eq!(config.dojo.api_token, "explicit");
    }

    #[test]
    fn test_from_toml() {
        let toml_str = r#"
[dojo]
base_url = "http://dojo:8080/api/v2"
api_token = "secret"
timeout_seconds = 30

[limits]
pt_window_size = 10
subdomains_concurrency = 8
nmap_concurrency = 2
pt_lock_ttl_minutes = 15
subdomains_running_timeout_minutes = 120
pass_parallelism = 4

[retry]
subdomains_max = 2
nmap_max = 2
targets_max = 2
acu_max = 4

[node_pool]
default_max_scans_per_node = 5
selection_policy = "weighted"
sticky_assignment = false
probe_timeout_seconds = 5
sticky_map_path = "/tmp/sticky.json"

[[node_pool.nodes]]
name = "acu-1"
endpoint = "https://10.0.0.1:3443"
token = "legacy-token-alias"
max_scans = 8
weight = 3

[executors]
artifact_dir = "/tmp"

[executors.subdomains]
command = "enum_subs_auto"
timeout_seconds = 600

[executors.nmap]
command = "process_nmap_ips_for_pt"
timeout_seconds = 600

[executors.targets]
command = "sync_pt_targets"
timeout_seconds = 300

[executors.acu]
command = "check_acu_pt"
timeout_seconds = 120
"#;
        let config = AppConfig::from_toml(toml_str).expect("解析失败");
        assert_eq!(config.limits.pt_window_size, 10);
        assert_eq!(config.retry.acu_max, 4);
        assert_eq!(config.node_pool.selection_policy, "weighted");
        // 遗留字段别名在反序列化时归一化
        let node = &config.node_pool.nodes[0];
        assert_eq!(node.credential, "legacy-token-alias");
        assert_eq!(node.max_scans_per_node, Some(8));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = AppConfig::default();
        config.node_pool.nodes.push(NodeEntry {
            name: "acu-1".to_string(),
            endpoint: "https://10.0.0.1:3443".to_string(),
            credential: "k".to_string(),
            max_scans_per_node: None,
            weight: None,
        });
        config.limits.pt_window_size = 0;
        assert!(config.validate().is_err());
    }
}
