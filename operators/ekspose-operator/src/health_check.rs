//! 健康检查模块
//!
//! 该模块提供 HTTP 端点供 Kubernetes 探针和 Prometheus 调用：
//! - `/healthz` 进程存活即返回 200，附带协调统计
//! - `/readyz` 缓存完成首次同步后返回 200，否则返回 503
//! - `/metrics` Prometheus 文本格式指标

use anyhow::{Context, Result};
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::ResourceCache;
use crate::config::MetricsConfig;
use crate::metrics::MetricsCollector;
use crate::reconcile::Reconciler;

/// 健康检查服务器
#[derive(Clone)]
pub struct HealthServer {
    /// 监听地址
    addr: SocketAddr,
    /// Deployment 本地缓存
    cache: Arc<ResourceCache>,
    /// 协调器
    reconciler: Arc<Reconciler>,
    /// 指标收集器
    metrics: Arc<MetricsCollector>,
}

impl HealthServer {
    /// 创建新的健康检查服务器
    pub fn new(
        config: &MetricsConfig,
        cache: Arc<ResourceCache>,
        reconciler: Arc<Reconciler>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.listen_address, config.port)
            .parse::<SocketAddr>()
            .with_context(|| format!("无效的监听地址: {}:{}", config.listen_address, config.port))?;

        Ok(Self {
            addr,
            cache,
            reconciler,
            metrics,
        })
    }

    /// 启动服务器，直到被取消
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.addr;
        let server = self.clone();

        let make_svc = make_service_fn(move |_| {
            let server = server.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req.uri().path()).await) }
                }))
            }
        });

        info!("健康检查服务器启动在 {}", addr);

        Server::try_bind(&addr)
            .with_context(|| format!("无法监听 {}", addr))?
            .serve(make_svc)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .context("健康检查服务器错误")?;

        info!("健康检查服务器已停止");
        Ok(())
    }

    /// 按路径处理请求
    pub async fn handle(&self, path: &str) -> Response<Body> {
        match path {
            "/healthz" => self.handle_health_check().await,
            "/readyz" => self.handle_readiness_check(),
            "/metrics" => self.handle_metrics(),
            _ => response(StatusCode::NOT_FOUND, "text/plain", Body::from("Not Found")),
        }
    }

    async fn handle_health_check(&self) -> Response<Body> {
        let state = self.reconciler.get_state().await;

        let body = serde_json::json!({
            "status": "ok",
            "cache_synced": self.cache.is_synced(),
            "cached_deployments": self.cache.len(),
            "reconciled": state.reconciled,
            "failed": state.failed,
            "last_reconcile_time": state.last_reconcile_time.map(|t| t.to_rfc3339()),
        });

        response(StatusCode::OK, "application/json", Body::from(body.to_string()))
    }

    fn handle_readiness_check(&self) -> Response<Body> {
        if self.cache.is_synced() {
            response(StatusCode::OK, "text/plain", Body::from("ok"))
        } else {
            response(
                StatusCode::SERVICE_UNAVAILABLE,
                "text/plain",
                Body::from("cache not synced"),
            )
        }
    }

    fn handle_metrics(&self) -> Response<Body> {
        match self.metrics.encode() {
            Ok((content_type, buffer)) => {
                let mut resp = Response::new(Body::from(buffer));
                if let Ok(value) = HeaderValue::from_str(&content_type) {
                    resp.headers_mut().insert(CONTENT_TYPE, value);
                }
                resp
            }
            Err(e) => {
                error!("导出指标失败: {:#}", e);
                response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    Body::from(e.to_string()),
                )
            }
        }
    }
}

fn response(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::platform::fake::FakePlatform;
    use crate::resources::ResourceBuilder;
    use kube::runtime::watcher;

    fn server() -> (HealthServer, Arc<ResourceCache>) {
        let config = OperatorConfig::default();
        let cache = Arc::new(ResourceCache::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(FakePlatform::default()),
            cache.clone(),
            ResourceBuilder::new(&config),
            None,
        ));
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let server = HealthServer::new(&config.metrics, cache.clone(), reconciler, metrics).unwrap();
        (server, cache)
    }

    async fn body_string(resp: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_readiness_follows_cache_sync() {
        let (server, cache) = server();
        assert_eq!(server.handle("/readyz").await.status(), StatusCode::SERVICE_UNAVAILABLE);

        cache.apply(watcher::Event::Restarted(vec![])).await;
        assert_eq!(server.handle("/readyz").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_reconcile_state() {
        let (server, _) = server();
        let resp = server.handle("/healthz").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["cache_synced"], false);
        assert_eq!(body["reconciled"], 0);
        assert!(body["last_reconcile_time"].is_null());
    }

    #[tokio::test]
    async fn test_metrics_and_unknown_paths() {
        let (server, _) = server();
        let resp = server.handle("/metrics").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.contains("ekspose_queue_depth"));

        assert_eq!(server.handle("/nope").await.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_invalid_listen_address() {
        let config = OperatorConfig::default();
        let cache = Arc::new(ResourceCache::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(FakePlatform::default()),
            cache.clone(),
            ResourceBuilder::new(&config),
            None,
        ));
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let mut metrics_config = config.metrics.clone();
        metrics_config.listen_address = "not an address".to_string();

        assert!(HealthServer::new(&metrics_config, cache, reconciler, metrics).is_err());
    }
}
