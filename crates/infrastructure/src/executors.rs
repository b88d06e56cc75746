//! 阶段执行器
//!
//! 子域名枚举、nmap处理、目标准备和acu完成检查都委托给外部命令。
//! 约定：命令行带 `--pt-id`（及可选的 `--slots` 预算），结果以单行
//! JSON摘要打到stdout最后一行，`ok` 为成败，子域名阶段附带扇出
//! 进度计数。执行器只认与自己阶段一致的payload。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use orchestrator_core::{OrchestratorError, OrchestratorResult, StageCommand};
use orchestrator_domain::entities::{DispatchItem, Stage, StageOutcome, SubdomainProgress};
use orchestrator_domain::repositories::StageExecutor;

pub struct ShellStageExecutor {
    stage: Stage,
    command: StageCommand,
}

/// 外部命令stdout最后一行的JSON摘要
#[derive(Debug, Deserialize)]
struct CommandSummary {
    ok: bool,
    #[serde(default)]
    pending: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    subdomains: Option<SubdomainProgress>,
}

impl ShellStageExecutor {
    pub fn new(stage: Stage, command: StageCommand) -> Self {
        Self { stage, command }
    }

    fn parse_summary(stage: Stage, stdout: &str) -> StageOutcome {
        let last_line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty());

        let Some(line) = last_line else {
            return StageOutcome::failed(format!("{stage} 执行器没有输出摘要"));
        };

        match serde_json::from_str::<CommandSummary>(line) {
            Ok(summary) => {
                let message = summary.error.or(summary.reason);
                let mut outcome = if summary.ok {
                    StageOutcome::ok()
                } else if summary.pending {
                    StageOutcome::pending()
                } else {
                    StageOutcome::failed(
                        message
                            .clone()
                            .unwrap_or_else(|| format!("{stage} 执行器上报失败")),
                    )
                };
                if outcome.message.is_none() {
                    outcome.message = message;
                }
                outcome.subdomains = summary.subdomains;
                outcome
            }
            Err(e) => StageOutcome::failed(format!("{stage} 执行器摘要不是合法JSON: {e}")),
        }
    }
}

#[async_trait]
impl StageExecutor for ShellStageExecutor {
    async fn execute(&self, item: &DispatchItem) -> OrchestratorResult<StageOutcome> {
        // 阶段不匹配直接拒绝，命令不会被启动
        if item.stage != self.stage {
            return Err(OrchestratorError::StageExecution(format!(
                "payload声明阶段 {} 与执行器阶段 {} 不一致",
                item.stage, self.stage
            )));
        }

        let mut cmd = Command::new(&self.command.command);
        cmd.args(&self.command.args);
        cmd.arg("--pt-id").arg(item.pt_id.to_string());
        if let Some(slots) = item.job_metadata.slots {
            cmd.arg("--slots").arg(slots.to_string());
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(
            "启动 {} 阶段命令: {} (pt={})",
            self.stage, self.command.command, item.pt_id
        );
        let mut child = cmd.spawn().map_err(|e| {
            OrchestratorError::StageExecution(format!(
                "启动 {} 阶段命令失败: {e}",
                self.stage
            ))
        })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::StageExecution("无法获取stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| OrchestratorError::StageExecution("无法获取stderr".to_string()))?;

        let timeout = Duration::from_secs(self.command.timeout_seconds);
        let run = async {
            let mut out_buf = String::new();
            let mut err_buf = String::new();
            // 两路输出并发读，防止某一路管道写满卡死子进程
            let _ = tokio::join!(
                stdout.read_to_string(&mut out_buf),
                stderr.read_to_string(&mut err_buf)
            );
            let status = child.wait().await;
            (out_buf, err_buf, status)
        };

        let (out_buf, err_buf, status) = match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "{} 阶段命令超时（{}秒），按失败处理 (pt={})",
                    self.stage, self.command.timeout_seconds, item.pt_id
                );
                return Ok(StageOutcome::failed(format!(
                    "{} 执行器超时（{}秒）",
                    self.stage, self.command.timeout_seconds
                )));
            }
        };

        let status = status.map_err(|e| {
            OrchestratorError::StageExecution(format!("等待 {} 阶段命令结束失败: {e}", self.stage))
        })?;

        let outcome = Self::parse_summary(self.stage, &out_buf);
        if !status.success() && outcome.success {
            // 摘要说成功但进程码非零，不可信
            let tail: String = err_buf.chars().rev().take(200).collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return Ok(StageOutcome::failed(format!(
                "{} 执行器退出码 {:?}，stderr: {tail}",
                self.stage,
                status.code()
            )));
        }
        Ok(outcome)
    }
}
