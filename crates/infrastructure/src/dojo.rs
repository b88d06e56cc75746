//! Dojo（系统记录源）客户端
//!
//! PT记录的读写全部走Dojo的REST API。状态块嵌在 product_type 的
//! description 字段里，这里只负责字段级读写，编解码在domain层。
//! 产品上的 needs:* 标签作为诊断信号一并带回，不参与任何门控。

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use orchestrator_core::{DojoConfig, OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::PtSummary;
use orchestrator_domain::repositories::ProductTypeStore;

pub struct DojoProductTypeStore {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct ProductTypeRow {
    id: i64,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductTypePage {
    #[serde(default)]
    results: Vec<ProductTypeRow>,
}

#[derive(Debug, Deserialize)]
struct ProductRow {
    #[serde(default)]
    tags: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ProductPage {
    #[serde(default)]
    results: Vec<ProductRow>,
    #[serde(default)]
    next: Option<String>,
}

/// Dojo的tags字段可能是字符串数组，也可能是 {"name": ...} 对象数组
fn normalize_tags(tags: &serde_json::Value) -> Vec<String> {
    match tags {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Object(obj) => obj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

impl DojoProductTypeStore {
    pub fn new(config: &DojoConfig) -> OrchestratorResult<Self> {
        if config.api_token.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "Dojo API token未配置".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.api_token)
    }

    /// 收集PT下产品的 needs:* 标签作为诊断信号
    async fn tag_signals(&self, pt_id: i64) -> OrchestratorResult<Vec<String>> {
        let mut signals = Vec::new();
        let mut url = format!(
            "{}/products/?prod_type={}&limit=200&offset=0",
            self.base_url, pt_id
        );

        loop {
            let page: ProductPage = self
                .client
                .get(&url)
                .header("Authorization", self.auth_header())
                .header("Accept", "application/json")
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            for product in &page.results {
                for tag in normalize_tags(&product.tags) {
                    if tag.starts_with("needs:") && !signals.contains(&tag) {
                        signals.push(tag);
                    }
                }
            }

            match page.next {
                Some(next) if next.starts_with("http") => url = next,
                Some(next) => url = format!("{}/{}", self.base_url, next.trim_start_matches('/')),
                None => break,
            }
        }

        Ok(signals)
    }
}

#[async_trait]
impl ProductTypeStore for DojoProductTypeStore {
    async fn list_window(&self, limit: usize) -> OrchestratorResult<Vec<PtSummary>> {
        let url = format!("{}/product_types/?limit={}&o=id", self.base_url, limit);
        let page: ProductTypePage = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut window = Vec::with_capacity(page.results.len());
        for row in page.results {
            let tags = match self.tag_signals(row.id).await {
                Ok(tags) => tags,
                Err(e) => {
                    // 诊断信号拿不到不拦路
                    warn!("读取PT {} 的标签信号失败: {e}", row.id);
                    Vec::new()
                }
            };
            window.push(PtSummary {
                id: row.id,
                name: row.name,
                description: row.description.unwrap_or_default(),
                tags,
            });
        }
        debug!("窗口加载 {} 个PT", window.len());
        Ok(window)
    }

    async fn get_raw(&self, pt_id: i64) -> OrchestratorResult<String> {
        let url = format!("{}/product_types/{}/", self.base_url, pt_id);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(OrchestratorError::PtNotFound { id: pt_id });
        }
        let row: ProductTypeRow = response.error_for_status()?.json().await?;
        Ok(row.description.unwrap_or_default())
    }

    async fn update_raw(&self, pt_id: i64, raw: &str) -> OrchestratorResult<()> {
        let url = format!("{}/product_types/{}/", self.base_url, pt_id);
        self.client
            .patch(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .json(&serde_json::json!({ "description": raw }))
            .send()
            .await?
            .error_for_status()?;
        debug!("PT {} 描述字段已写回 ({} 字节)", pt_id, raw.len());
        Ok(())
    }
}
