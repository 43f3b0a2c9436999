//! Ekspose Operator - 为 Deployment 自动暴露 Service 与 Ingress
//!
//! 该模块实现了 Ekspose 的 Kubernetes 控制器：监听 Deployment，
//! 为每个 Deployment 创建同名的 Service 和 Ingress，
//! 并在 Deployment 被删除后清理这些由控制器创建的资源。

pub mod cache;
pub mod config;
pub mod controller;
pub mod event_handler;
pub mod health_check;
pub mod metrics;
pub mod platform;
pub mod queue;
pub mod reconcile;
pub mod resources;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::OperatorConfig;
use crate::controller::Controller;
use crate::health_check::HealthServer;
use crate::metrics::MetricsCollector;
use crate::platform::KubePlatform;

/// Operator 主结构体
pub struct EksposeOperator {
    /// Kubernetes 客户端
    client: Client,
    /// 控制器配置
    config: OperatorConfig,
    /// 控制器
    controller: Arc<Controller>,
    /// 指标收集器
    metrics: Arc<MetricsCollector>,
}

impl EksposeOperator {
    /// 创建新的 Operator 实例
    pub fn new(config: OperatorConfig, kube_config: kube::Config) -> Result<Self> {
        // 创建 Kubernetes 客户端
        let client = Client::try_from(kube_config).context("创建 Kubernetes 客户端失败")?;

        let metrics = Arc::new(MetricsCollector::new()?);
        let platform = Arc::new(KubePlatform::new(client.clone()));
        let controller = Arc::new(Controller::new(config.clone(), platform, metrics.clone()));

        Ok(Self {
            client,
            config,
            controller,
            metrics,
        })
    }

    /// 运行 Operator，直到收到停止信号
    pub async fn run(&self) -> Result<()> {
        let cancel = self.controller.cancellation_token();

        // 启动健康检查与指标服务器
        let health_task = if self.config.metrics.enabled {
            let server = HealthServer::new(
                &self.config.metrics,
                self.controller.get_cache(),
                self.controller.get_reconciler(),
                self.metrics.clone(),
            )?;
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server.serve(cancel.clone()).await {
                    error!("健康检查服务器退出: {:#}", e);
                    // 无法提供探针时整体退出
                    cancel.cancel();
                }
            }))
        } else {
            info!("指标服务器已禁用");
            None
        };

        let result = self.controller.run(self.client.clone()).await;

        cancel.cancel();
        if let Some(task) = health_task {
            if let Err(e) = task.await {
                error!("健康检查任务异常退出: {}", e);
            }
        }

        result
    }

    /// 停止 Operator
    pub fn stop(&self) {
        self.controller.stop();
    }

    /// 获取取消信号，取消后 Operator 开始关闭
    pub fn cancellation_token(&self) -> CancellationToken {
        self.controller.cancellation_token()
    }
}

/// 加载 Kubernetes 连接配置
///
/// 指定了 kubeconfig 文件时优先使用它，读取失败则退回集群内配置。
/// 未指定时按 kube 的默认顺序推断。
pub async fn load_kube_config(kubeconfig: Option<&Path>) -> Result<kube::Config> {
    let path = match kubeconfig {
        Some(path) => path,
        None => return kube::Config::infer().await.context("推断 Kubernetes 配置失败"),
    };

    match read_kubeconfig(path).await {
        Ok(config) => {
            info!("使用 kubeconfig: {}", path.display());
            Ok(config)
        }
        Err(e) => {
            warn!("读取 kubeconfig {} 失败，改用集群内配置: {:#}", path.display(), e);
            kube::Config::incluster().context("获取集群内配置失败")
        }
    }
}

async fn read_kubeconfig(path: &Path) -> Result<kube::Config> {
    let kubeconfig = Kubeconfig::read_from(path).context("读取 kubeconfig 失败")?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("解析 kubeconfig 失败")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: test
  cluster:
    server: https://127.0.0.1:6443
contexts:
- name: test
  context:
    cluster: test
    user: test
    namespace: apps
current-context: test
users:
- name: test
  user:
    token: secret
"#;

    #[tokio::test]
    async fn test_load_kube_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(KUBECONFIG.as_bytes()).unwrap();

        let config = load_kube_config(Some(file.path())).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("127.0.0.1"));
        assert_eq!(config.cluster_url.port_u16(), Some(6443));
        assert_eq!(config.default_namespace, "apps");
    }

    #[tokio::test]
    async fn test_unreadable_kubeconfig_falls_back_to_incluster() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");

        let result = load_kube_config(Some(&missing)).await;
        // 测试环境不在集群内时两者都失败；在集群内时退回集群内配置
        match kube::Config::incluster() {
            Ok(incluster) => assert_eq!(result.unwrap().cluster_url, incluster.cluster_url),
            Err(_) => assert!(result.is_err()),
        }
    }
}
