//! 文件持久化的粘性分配表
//!
//! pt_id → 节点名，跨轮存续。文件格式沿用映射工件的惯例：
//! 带version和updated_at的JSON，items按pt_id键入。写入先落
//! 临时文件再原子rename，半写的文件不会被下一轮读到。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::repositories::StickyAssignmentStore;

const STICKY_MAP_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StickyItem {
    node_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StickyMapFile {
    version: u32,
    updated_at: Option<String>,
    #[serde(default)]
    items: HashMap<String, StickyItem>,
}

pub struct FileStickyStore {
    path: PathBuf,
    map: RwLock<HashMap<i64, String>>,
}

impl FileStickyStore {
    /// 从文件装载。文件不存在按空表处理；内容损坏时告警并从空表
    /// 重建（粘性只是偏好，丢了可以再积累）。
    pub fn load(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let path = path.as_ref().to_path_buf();
        let map = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<StickyMapFile>(&content) {
                Ok(file) if file.version == STICKY_MAP_VERSION => file
                    .items
                    .into_iter()
                    .filter_map(|(k, v)| k.parse::<i64>().ok().map(|id| (id, v.node_name)))
                    .collect(),
                Ok(file) => {
                    warn!(
                        "粘性分配表版本 {} 不支持，从空表重建: {}",
                        file.version,
                        path.display()
                    );
                    HashMap::new()
                }
                Err(e) => {
                    warn!("粘性分配表损坏，从空表重建: {e}");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(OrchestratorError::Internal(format!(
                    "读取粘性分配表失败: {e}"
                )));
            }
        };

        debug!("粘性分配表装载 {} 条 ({})", map.len(), path.display());
        Ok(Self {
            path,
            map: RwLock::new(map),
        })
    }

    async fn flush(&self, map: &HashMap<i64, String>) -> OrchestratorResult<()> {
        let file = StickyMapFile {
            version: STICKY_MAP_VERSION,
            updated_at: Some(Utc::now().to_rfc3339()),
            items: map
                .iter()
                .map(|(id, node)| {
                    (
                        id.to_string(),
                        StickyItem {
                            node_name: node.clone(),
                        },
                    )
                })
                .collect(),
        };
        let payload = serde_json::to_string(&file)
            .map_err(|e| OrchestratorError::Serialization(format!("粘性分配表序列化失败: {e}")))?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| OrchestratorError::Internal(format!("创建目录失败: {e}")))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("写粘性分配表临时文件失败: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("粘性分配表rename失败: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl StickyAssignmentStore for FileStickyStore {
    async fn get(&self, pt_id: i64) -> OrchestratorResult<Option<String>> {
        Ok(self.map.read().await.get(&pt_id).cloned())
    }

    async fn set(&self, pt_id: i64, node_name: &str) -> OrchestratorResult<()> {
        let mut map = self.map.write().await;
        map.insert(pt_id, node_name.to_string());
        self.flush(&map).await
    }

    async fn remove(&self, pt_id: i64) -> OrchestratorResult<()> {
        let mut map = self.map.write().await;
        if map.remove(&pt_id).is_some() {
            self.flush(&map).await?;
        }
        Ok(())
    }
}
