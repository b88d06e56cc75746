use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orchestrator_core::AppConfig;

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("orchestrator")
        .version("1.0.0")
        .about("安全扫描流水线编排系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["once", "loop"])
                .default_value("once"),
        )
        .arg(
            Arg::new("interval-seconds")
                .long("interval-seconds")
                .value_name("SECONDS")
                .help("loop模式下两轮之间的间隔秒数")
                .default_value("300"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode_str = matches.get_one::<String>("mode").unwrap();
    let interval_str = matches.get_one::<String>("interval-seconds").unwrap();
    let log_level = matches.get_one::<String>("log-level").unwrap();
    let log_format = matches.get_one::<String>("log-format").unwrap();

    // 初始化日志系统
    init_logging(log_level, log_format)?;

    info!("启动安全扫描流水线编排系统");
    info!("运行模式: {mode_str}");

    // 加载配置
    let config = AppConfig::load(config_path.map(String::as_str)).context("加载配置失败")?;

    let app_mode = parse_app_mode(mode_str, interval_str)?;
    let app = Application::new(config, app_mode)?;

    // 创建优雅关闭管理器
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = std::sync::Arc::new(app);
        let shutdown_rx = shutdown_manager.subscribe().await;

        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e}");
            }
        })
    };

    // once模式等轮次自然结束；loop模式等关闭信号
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown().await;

            match tokio::time::timeout(Duration::from_secs(30), &mut app_handle).await {
                Ok(result) => {
                    if let Err(e) = result {
                        error!("应用关闭时发生错误: {e}");
                    } else {
                        info!("应用已优雅关闭");
                    }
                }
                Err(_) => {
                    warn!("应用关闭超时，强制退出");
                }
            }
        }
        result = &mut app_handle => {
            if let Err(e) = result {
                error!("应用运行时发生错误: {e}");
            }
            shutdown_manager.shutdown().await;
        }
    }

    info!("编排系统已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 解析应用运行模式
fn parse_app_mode(mode_str: &str, interval_str: &str) -> Result<AppMode> {
    match mode_str {
        "once" => Ok(AppMode::Once),
        "loop" => {
            let interval_seconds: u64 = interval_str
                .parse()
                .with_context(|| format!("非法的间隔秒数: {interval_str}"))?;
            if interval_seconds == 0 {
                return Err(anyhow::anyhow!("间隔秒数必须大于0"));
            }
            Ok(AppMode::Loop { interval_seconds })
        }
        _ => Err(anyhow::anyhow!("不支持的运行模式: {mode_str}")),
    }
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
