//! Acunetix扫描节点客户端
//!
//! 设备普遍用自签名TLS证书，客户端放开证书校验。所有请求带
//! X-Auth头，凭证来自节点描述（配置层已做过别名归一化）。

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::{ScanNode, ScanTarget};
use orchestrator_domain::repositories::ScanNodeClient;

/// Acunetix内置的完整扫描profile
const FULL_SCAN_PROFILE_ID: &str = "11111111-1111-1111-1111-111111111111";

/// 计入活跃会话的扫描状态
const ACTIVE_SCAN_STATUSES: [&str; 3] = ["processing", "queued", "starting"];

pub struct AcunetixClient {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ScanSession {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ScanRow {
    #[serde(default)]
    current_session: Option<ScanSession>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScansPage {
    #[serde(default)]
    scans: Vec<ScanRow>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct TargetCreated {
    target_id: String,
}

#[derive(Debug, Deserialize)]
struct ScanStarted {
    scan_id: String,
}

impl AcunetixClient {
    pub fn new(timeout_seconds: u64) -> OrchestratorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }

    fn endpoint(node: &ScanNode, path: &str) -> String {
        format!("{}{}", node.endpoint.trim_end_matches('/'), path)
    }

    fn ensure_credential(node: &ScanNode) -> OrchestratorResult<()> {
        if node.credential.trim().is_empty() {
            return Err(OrchestratorError::Configuration(format!(
                "节点 {} 缺少凭证，拒绝发起请求",
                node.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ScanNodeClient for AcunetixClient {
    async fn health(&self, node: &ScanNode) -> OrchestratorResult<()> {
        Self::ensure_credential(node)?;
        self.client
            .get(Self::endpoint(node, "/api/v1/me"))
            .header("X-Auth", &node.credential)
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn active_sessions(&self, node: &ScanNode) -> OrchestratorResult<u32> {
        Self::ensure_credential(node)?;
        let mut url = Self::endpoint(node, "/api/v1/scans?l=100");
        let mut active = 0u32;

        loop {
            let page: ScansPage = self
                .client
                .get(&url)
                .header("X-Auth", &node.credential)
                .header("Accept", "application/json")
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            active += page
                .scans
                .iter()
                .filter(|scan| {
                    scan.current_session
                        .as_ref()
                        .map(|s| ACTIVE_SCAN_STATUSES.contains(&s.status.as_str()))
                        .unwrap_or(false)
                })
                .count() as u32;

            match page.pagination.and_then(|p| p.next_cursor) {
                Some(cursor) if !cursor.is_empty() => {
                    url = Self::endpoint(node, &format!("/api/v1/scans?l=100&c={cursor}"));
                }
                _ => break,
            }
        }

        debug!("节点 {} 活跃扫描会话: {}", node.name, active);
        Ok(active)
    }

    async fn start_scan(&self, node: &ScanNode, target: &ScanTarget) -> OrchestratorResult<String> {
        Self::ensure_credential(node)?;

        // 先登记target再发起扫描
        let created: TargetCreated = self
            .client
            .post(Self::endpoint(node, "/api/v1/targets"))
            .header("X-Auth", &node.credential)
            .header("Accept", "application/json")
            .json(&serde_json::json!({
                "address": target.url,
                "description": target.label,
                "criticality": 10,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let started: ScanStarted = self
            .client
            .post(Self::endpoint(node, "/api/v1/scans"))
            .header("X-Auth", &node.credential)
            .header("Accept", "application/json")
            .json(&serde_json::json!({
                "target_id": created.target_id,
                "profile_id": FULL_SCAN_PROFILE_ID,
                "schedule": {
                    "disable": false,
                    "start_date": null,
                    "time_sensitive": false,
                },
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(
            "节点 {} 启动扫描 {} (target={})",
            node.name, started.scan_id, target.url
        );
        Ok(started.scan_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(credential: &str) -> ScanNode {
        ScanNode {
            name: "acu-1".to_string(),
            endpoint: "https://10.0.0.1:3443/".to_string(),
            credential: credential.to_string(),
            max_scans: 5,
            weight: 1,
            active_sessions: 0,
            healthy: false,
        }
    }

    #[test]
    fn test_endpoint_join_strips_trailing_slash() {
        let n = node("k");
        assert_eq!(
            AcunetixClient::endpoint(&n, "/api/v1/me"),
            "https://10.0.0.1:3443/api/v1/me"
        );
    }

    #[tokio::test]
    async fn test_empty_credential_never_sends() {
        let client = AcunetixClient::new(5).unwrap();
        let n = node("  ");
        // 空凭证直接拒绝，不产生网络请求
        assert!(matches!(
            client.health(&n).await,
            Err(OrchestratorError::Configuration(_))
        ));
        assert!(matches!(
            client.active_sessions(&n).await,
            Err(OrchestratorError::Configuration(_))
        ));
    }
}
