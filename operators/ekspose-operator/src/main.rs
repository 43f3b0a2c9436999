//! Ekspose - 为 Deployment 自动创建 Service 与 Ingress 的控制器

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ekspose_operator::config::OperatorConfig;
use ekspose_operator::{load_kube_config, EksposeOperator};

/// Ekspose 命令行参数
#[derive(Parser, Debug)]
#[command(name = "ekspose", version, about, long_about = None)]
struct Cli {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short, long, env = "EKSPOSE_CONFIG")]
    config: Option<PathBuf>,

    /// kubeconfig 文件路径，读取失败时使用集群内配置
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// 只监听指定命名空间
    #[arg(short, long)]
    namespace: Option<String>,

    /// 协调 worker 数量
    #[arg(short, long)]
    workers: Option<usize>,

    /// 日志级别，RUST_LOG 优先
    #[arg(long)]
    log_level: Option<String>,

    /// 打印生效的配置后退出
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// 加载配置并应用命令行覆盖
    fn load_config(&self) -> Result<OperatorConfig> {
        let mut config = OperatorConfig::load(self.config.as_deref())?;

        if let Some(namespace) = &self.namespace {
            config.namespace = Some(namespace.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    if cli.print_config {
        let yaml = serde_yaml::to_string(&config).context("序列化配置失败")?;
        println!("{yaml}");
        return Ok(());
    }

    // 初始化日志
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!(
        "配置加载完成: namespace={}, workers={}",
        config.namespace.as_deref().unwrap_or("<all>"),
        config.workers
    );

    let kube_config = load_kube_config(cli.kubeconfig.as_deref()).await?;
    let operator = EksposeOperator::new(config, kube_config)?;
    tokio::spawn(shutdown_signal(operator.cancellation_token()));

    operator.run().await
}

/// 等待 Ctrl-C 或 SIGTERM 后触发取消
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("无法监听 Ctrl-C 信号: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("无法监听 SIGTERM 信号: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("收到停止信号，开始关闭");
    cancel.cancel();
}
