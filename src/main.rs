use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};

use mole::logging::parse_level;
use mole::{setup_logging, Config, TunnelManager};

#[derive(Parser, Debug)]
#[clap(author, version, about = "通过 SSH 隧道将本地端口持久转发到远程地址", long_about = None)]
struct Args {
    /// 配置文件路径，默认依次查找 /etc/mole/、$HOME/.mole/ 和当前目录下的 mole.yaml
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// 日志级别 (trace, debug, info, warn, error)，覆盖配置文件中的 log_level
    #[clap(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("无法读取配置")?;

    let level_name = args.log_level.or_else(|| config.log_level.clone());
    let level = match level_name.as_deref() {
        Some(name) => parse_level(name).ok_or_else(|| anyhow!("无效的日志级别: {}", name))?,
        None => Level::INFO,
    };
    setup_logging(level, "MOLE");

    info!(tunnels = config.tunnels.len(), "正在启动隧道");

    let manager = TunnelManager::default();
    let shutdown = manager.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("收到关闭信号，正在关闭所有隧道...");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "无法监听关闭信号"),
        }
    });

    let reports = manager.run(config.tunnels).await;
    let failed: Vec<_> = reports.iter().filter(|r| r.is_failure()).map(|r| r.name.as_str()).collect();
    if failed.is_empty() {
        info!("所有隧道已停止");
        Ok(())
    } else {
        Err(anyhow!("以下隧道异常终止: {}", failed.join(", ")))
    }
}
