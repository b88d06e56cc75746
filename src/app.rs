use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use orchestrator_core::AppConfig;
use orchestrator_dispatcher::{OrchestrationPass, StageExecutors};
use orchestrator_domain::entities::Stage;
use orchestrator_infrastructure::{
    AcunetixClient, DojoProductTypeStore, FileStickyStore, FileTargetListStore, ShellStageExecutor,
};

/// 应用运行模式
#[derive(Debug, Clone)]
pub enum AppMode {
    /// 跑一轮就退出（cron触发或人工触发）
    Once,
    /// 常驻进程，按间隔循环跑
    Loop { interval_seconds: u64 },
}

/// 主应用程序
pub struct Application {
    mode: AppMode,
    pass: OrchestrationPass,
}

impl Application {
    /// 装配所有外部协作方并创建应用实例
    pub fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化编排器，模式: {:?}", mode);

        let store = Arc::new(
            DojoProductTypeStore::new(&config.dojo).context("创建Dojo客户端失败")?,
        );
        let sticky = Arc::new(
            FileStickyStore::load(&config.node_pool.sticky_map_path)
                .context("装载粘性分配表失败")?,
        );
        let node_client = Arc::new(
            AcunetixClient::new(config.node_pool.probe_timeout_seconds)
                .context("创建Acunetix客户端失败")?,
        );
        let target_lists = Arc::new(FileTargetListStore::new(&config.executors.artifact_dir));

        let executors = StageExecutors {
            subdomains: Arc::new(ShellStageExecutor::new(
                Stage::Subdomains,
                config.executors.subdomains.clone(),
            )),
            nmap: Arc::new(ShellStageExecutor::new(
                Stage::Nmap,
                config.executors.nmap.clone(),
            )),
            targets: Arc::new(ShellStageExecutor::new(
                Stage::Targets,
                config.executors.targets.clone(),
            )),
            acu: Arc::new(ShellStageExecutor::new(
                Stage::Acu,
                config.executors.acu.clone(),
            )),
        };

        let pass = OrchestrationPass::new(
            config,
            store,
            sticky,
            node_client,
            target_lists,
            executors,
        );

        Ok(Self { mode, pass })
    }

    /// 运行应用程序
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        match &self.mode {
            AppMode::Once => {
                self.run_once().await;
                Ok(())
            }
            AppMode::Loop { interval_seconds } => {
                let interval = Duration::from_secs(*interval_seconds);
                info!("进入循环模式，间隔 {} 秒", interval_seconds);
                loop {
                    self.run_once().await;

                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown_rx.recv() => {
                            info!("收到关闭信号，退出调度循环");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn run_once(&self) {
        match self.pass.run().await {
            Ok(summary) => {
                if let Some(e) = &summary.dispatch_config_error {
                    error!("分发步骤因配置错误中止: {e}");
                }
                if summary.frozen > 0 {
                    warn!("{} 个PT处于冻结状态，需要人工清理重试计数", summary.frozen);
                }
            }
            Err(e) => {
                error!("本轮编排失败: {e}");
            }
        }
    }
}
