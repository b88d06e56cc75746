//! 目标清单工件
//!
//! targets阶段的执行器把每个PT的待扫目标写成带严格标记的文本
//! 工件（`pt_targets_<id>.txt`），这里负责解析并跟踪哪些目标已经
//! 分发过。行格式固定为 `<http(s)://地址>, <标签>`，标记缺失或行
//! 格式不对都按解析错误处理，绝不猜。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::ScanTarget;
use orchestrator_domain::repositories::TargetListStore;

pub const TARGET_BLOCK_START: &str = "PT_TARGET_LIST_START";
pub const TARGET_BLOCK_END: &str = "PT_TARGET_LIST_END";

pub struct FileTargetListStore {
    artifact_dir: PathBuf,
}

/// 解析一行目标：`https://host[:port], label`
fn parse_target_line(line: &str) -> Option<ScanTarget> {
    let (url, label) = line.split_once(',')?;
    let url = url.trim();
    let label = label.trim();
    if label.is_empty() || url.contains(char::is_whitespace) {
        return None;
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return None;
    }
    Some(ScanTarget {
        url: url.to_string(),
        label: label.to_string(),
    })
}

/// 解析整个工件内容。标记对必须完整，块内每个非空行都必须合法。
pub fn parse_targets_artifact(content: &str) -> OrchestratorResult<Vec<ScanTarget>> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with(TARGET_BLOCK_START) {
        return Err(OrchestratorError::Serialization(format!(
            "目标工件缺少 {TARGET_BLOCK_START} 标记"
        )));
    }
    let body_start = trimmed.find('\n').map(|i| i + 1).unwrap_or(trimmed.len());
    let rest = &trimmed[body_start..];
    let end = rest.find(TARGET_BLOCK_END).ok_or_else(|| {
        OrchestratorError::Serialization(format!("目标工件缺少 {TARGET_BLOCK_END} 标记"))
    })?;

    let mut targets = Vec::new();
    for line in rest[..end].lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let target = parse_target_line(line).ok_or_else(|| {
            OrchestratorError::Serialization(format!("目标工件行格式非法: {line}"))
        })?;
        targets.push(target);
    }
    Ok(targets)
}

impl FileTargetListStore {
    pub fn new(artifact_dir: impl AsRef<Path>) -> Self {
        Self {
            artifact_dir: artifact_dir.as_ref().to_path_buf(),
        }
    }

    fn artifact_path(&self, pt_id: i64) -> PathBuf {
        self.artifact_dir.join(format!("pt_targets_{pt_id}.txt"))
    }

    fn dispatched_path(&self, pt_id: i64) -> PathBuf {
        self.artifact_dir
            .join(format!("pt_targets_{pt_id}.dispatched.json"))
    }

    async fn dispatched_set(&self, pt_id: i64) -> OrchestratorResult<HashSet<String>> {
        match tokio::fs::read_to_string(self.dispatched_path(pt_id)).await {
            Ok(content) => serde_json::from_str::<Vec<String>>(&content)
                .map(|urls| urls.into_iter().collect())
                .map_err(|e| {
                    OrchestratorError::Serialization(format!("已分发清单解析失败: {e}"))
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
            Err(e) => Err(OrchestratorError::Internal(format!(
                "读取已分发清单失败: {e}"
            ))),
        }
    }
}

#[async_trait]
impl TargetListStore for FileTargetListStore {
    async fn pending_targets(&self, pt_id: i64) -> OrchestratorResult<Vec<ScanTarget>> {
        let content = match tokio::fs::read_to_string(self.artifact_path(pt_id)).await {
            Ok(content) => content,
            // 工件还没产出：没有待扫目标
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(OrchestratorError::Internal(format!(
                    "读取目标工件失败: {e}"
                )));
            }
        };

        let all = parse_targets_artifact(&content)?;
        let dispatched = self.dispatched_set(pt_id).await?;
        let pending: Vec<ScanTarget> = all
            .into_iter()
            .filter(|t| !dispatched.contains(&t.url))
            .collect();
        debug!("PT {} 待扫目标 {} 个", pt_id, pending.len());
        Ok(pending)
    }

    async fn mark_dispatched(&self, pt_id: i64, target: &ScanTarget) -> OrchestratorResult<()> {
        let mut dispatched = self.dispatched_set(pt_id).await?;
        if !dispatched.insert(target.url.clone()) {
            return Ok(());
        }
        let mut urls: Vec<&String> = dispatched.iter().collect();
        urls.sort();
        let payload = serde_json::to_string(&urls)
            .map_err(|e| OrchestratorError::Serialization(format!("已分发清单序列化失败: {e}")))?;

        tokio::fs::create_dir_all(&self.artifact_dir)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("创建工件目录失败: {e}")))?;
        let path = self.dispatched_path(pt_id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("写已分发清单失败: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("已分发清单rename失败: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(lines: &[&str]) -> String {
        format!(
            "{TARGET_BLOCK_START}\n{}\n{TARGET_BLOCK_END}\n",
            lines.join("\n")
        )
    }

    #[test]
    fn test_parse_artifact() {
        let content = artifact(&[
            "https://example.com, example corp",
            "http://10.0.0.5:8080, example corp",
        ]);
        let targets = parse_targets_artifact(&content).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].url, "https://example.com");
        assert_eq!(targets[1].label, "example corp");
    }

    #[test]
    fn test_parse_rejects_missing_markers() {
        assert!(parse_targets_artifact("https://a.com, x\n").is_err());
        assert!(parse_targets_artifact(&format!(
            "{TARGET_BLOCK_START}\nhttps://a.com, x\n"
        ))
        .is_err());
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        let content = artifact(&["ftp://a.com, x"]);
        assert!(parse_targets_artifact(&content).is_err());
        let content = artifact(&["https://a.com"]);
        assert!(parse_targets_artifact(&content).is_err());
        let content = artifact(&["https://a .com, x"]);
        assert!(parse_targets_artifact(&content).is_err());
    }

    #[tokio::test]
    async fn test_pending_and_mark_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTargetListStore::new(dir.path());
        std::fs::write(
            dir.path().join("pt_targets_42.txt"),
            artifact(&["https://a.com, pt", "https://b.com, pt"]),
        )
        .unwrap();

        let pending = store.pending_targets(42).await.unwrap();
        assert_eq!(pending.len(), 2);

        store.mark_dispatched(42, &pending[0]).await.unwrap();
        let pending = store.pending_targets(42).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].url, "https://b.com");

        // 重复标记幂等
        store
            .mark_dispatched(
                42,
                &ScanTarget {
                    url: "https://a.com".to_string(),
                    label: "pt".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(store.pending_targets(42).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_artifact_means_no_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTargetListStore::new(dir.path());
        assert!(store.pending_targets(7).await.unwrap().is_empty());
    }
}
