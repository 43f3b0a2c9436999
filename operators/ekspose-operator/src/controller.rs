//! 控制器模块
//!
//! 该模块把缓存、事件桥、工作队列和协调器组装在一起：
//! 启动 Deployment 监听任务，等待缓存首次同步，然后运行多个协调 worker，
//! 直到收到取消信号。取消后停止监听、关闭队列，并等待进行中的协调完成。

use anyhow::Result;
use futures::Stream;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::Api,
    client::Client,
    runtime::{watcher, WatchStreamExt},
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ResourceCache;
use crate::config::OperatorConfig;
use crate::event_handler::EventBridge;
use crate::metrics::MetricsCollector;
use crate::platform::PlatformClient;
use crate::queue::ChangeQueue;
use crate::reconcile::{ErrorAction, Reconciler};
use crate::resources::ResourceBuilder;

/// 控制器结构体
pub struct Controller {
    /// 控制器配置
    config: OperatorConfig,
    /// Deployment 本地缓存
    cache: Arc<ResourceCache>,
    /// 工作队列
    queue: ChangeQueue,
    /// 事件桥
    bridge: Arc<EventBridge>,
    /// 协调器
    reconciler: Arc<Reconciler>,
    /// 指标收集器
    metrics: Arc<MetricsCollector>,
    /// 取消信号
    cancel: CancellationToken,
}

impl Controller {
    /// 创建新的控制器
    pub fn new(
        config: OperatorConfig,
        platform: Arc<dyn PlatformClient>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let cache = Arc::new(ResourceCache::new());
        let queue = ChangeQueue::new(&config.backoff);
        let bridge = Arc::new(EventBridge::new(
            cache.clone(),
            queue.clone(),
            metrics.clone(),
            config.reconcile_on_update,
        ));
        let reconciler = Arc::new(Reconciler::new(
            platform,
            cache.clone(),
            ResourceBuilder::new(&config),
            config.max_permanent_retries,
        ));

        Self {
            config,
            cache,
            queue,
            bridge,
            reconciler,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    /// 监听 Deployment 并运行控制器，直到被取消
    pub async fn run(&self, client: Client) -> Result<()> {
        let api: Api<Deployment> = match &self.config.namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };

        let mut watcher_config = watcher::Config::default();
        if let Some(selector) = &self.config.label_selector {
            watcher_config = watcher_config.labels(selector);
        }

        let stream = watcher(api, watcher_config).default_backoff();
        self.run_with_stream(stream).await
    }

    /// 使用给定的监听事件流运行控制器，直到被取消
    pub async fn run_with_stream<S>(&self, stream: S) -> Result<()>
    where
        S: Stream<Item = Result<watcher::Event<Deployment>, watcher::Error>> + Send + 'static,
    {
        info!("启动 Ekspose 控制器");

        let watch_task = {
            let bridge = self.bridge.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move { bridge.run_stream(stream, cancel).await })
        };

        if !self.wait_for_cache_sync().await && !self.cancel.is_cancelled() {
            error!("等待缓存同步失败，控制器以降级状态继续运行");
        }

        let workers: Vec<_> = (0..self.config.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: self.queue.clone(),
                    reconciler: self.reconciler.clone(),
                    metrics: self.metrics.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        info!("已启动 {} 个协调 worker", workers.len());

        self.cancel.cancelled().await;
        info!("收到停止信号，正在关闭控制器");

        self.queue.shut_down().await;
        for worker in workers {
            if let Err(e) = worker.await {
                error!("协调 worker 异常退出: {}", e);
            }
        }

        if let Err(e) = watch_task.await {
            error!("Deployment 监听任务异常退出: {}", e);
        }

        info!("Ekspose 控制器已停止");
        Ok(())
    }

    async fn wait_for_cache_sync(&self) -> bool {
        info!("等待 Deployment 缓存同步");
        match self.config.sync_timeout() {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.cache.wait_until_synced(&self.cancel)).await {
                    Ok(synced) => synced,
                    Err(_) => {
                        warn!("缓存同步超时: {:?}", timeout);
                        false
                    }
                }
            }
            None => self.cache.wait_until_synced(&self.cancel).await,
        }
    }

    /// 停止控制器
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// 获取取消信号
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 获取协调器
    pub fn get_reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    /// 获取本地缓存
    pub fn get_cache(&self) -> Arc<ResourceCache> {
        self.cache.clone()
    }

    /// 获取工作队列
    pub fn get_queue(&self) -> ChangeQueue {
        self.queue.clone()
    }
}

/// 协调 worker
struct Worker {
    /// 编号
    id: usize,
    /// 工作队列
    queue: ChangeQueue,
    /// 协调器
    reconciler: Arc<Reconciler>,
    /// 指标收集器
    metrics: Arc<MetricsCollector>,
}

impl Worker {
    /// 循环处理队列中的键，直到队列关闭
    async fn run(self) {
        debug!("协调 worker {} 已启动", self.id);
        while self.process_next().await {}
        debug!("协调 worker {} 已退出", self.id);
    }

    /// 处理一个键，队列关闭时返回 `false`
    async fn process_next(&self) -> bool {
        let key = match self.queue.get().await {
            Some(key) => key,
            None => return false,
        };

        let start = Instant::now();
        match self.reconciler.reconcile(&key).await {
            Ok(outcome) => {
                debug!("协调 {} 完成: {:?}", key, outcome);
                self.metrics.record_success(start.elapsed());
                self.queue.forget(&key).await;
                self.reconciler.forget(&key).await;
            }
            Err(e) => {
                self.metrics.record_failure(e.kind().as_str(), start.elapsed());
                match self.reconciler.handle_error(&key, &e).await {
                    ErrorAction::Requeue => {
                        self.queue.add_rate_limited(key.clone()).await;
                    }
                    ErrorAction::Drop => {
                        self.queue.forget(&key).await;
                        self.metrics.record_dead_letter();
                    }
                }
            }
        }

        self.queue.done(&key).await;
        self.metrics.set_queue_depth(self.queue.len().await);
        true
    }
}
