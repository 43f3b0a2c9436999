//! 事件处理模块
//!
//! 该模块驱动 Deployment 监听流，把事件写入本地缓存，
//! 并把缓存产生的新增、删除通知转换为协调键放入工作队列。
//! 删除通知与新增通知的处理方式完全相同：通知只说明何时需要检查，
//! 资源是否存在由协调器向 API 查询后决定。

use ekspose_common::ReconcileKey;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Notification, ResourceCache};
use crate::metrics::MetricsCollector;
use crate::queue::ChangeQueue;

/// 事件桥
pub struct EventBridge {
    /// Deployment 本地缓存
    cache: Arc<ResourceCache>,
    /// 工作队列
    queue: ChangeQueue,
    /// 指标收集器
    metrics: Arc<MetricsCollector>,
    /// 更新通知是否也入队
    reconcile_on_update: bool,
}

impl EventBridge {
    /// 创建新的事件桥
    pub fn new(
        cache: Arc<ResourceCache>,
        queue: ChangeQueue,
        metrics: Arc<MetricsCollector>,
        reconcile_on_update: bool,
    ) -> Self {
        Self {
            cache,
            queue,
            metrics,
            reconcile_on_update,
        }
    }

    /// 处理一条缓存通知
    ///
    /// 协调键在这里立即从对象中提取，队列不持有对象本身。
    pub async fn handle(&self, notification: Notification) {
        let event = match &notification {
            Notification::Added(_) => "added",
            Notification::Updated(_) => "updated",
            Notification::Deleted(_) => "deleted",
        };
        self.metrics.record_event(event);

        if matches!(notification, Notification::Updated(_)) && !self.reconcile_on_update {
            debug!(
                "忽略 Deployment 更新事件: {}",
                notification.object().metadata.name.as_deref().unwrap_or("<unknown>")
            );
            return;
        }

        let meta = &notification.object().metadata;
        let key = match ReconcileKey::from_parts(meta.namespace.as_deref(), meta.name.as_deref()) {
            Ok(key) => key,
            Err(e) => {
                warn!("无法从 {} 事件中提取协调键: {}", event, e);
                return;
            }
        };

        debug!("Deployment {} 事件: {}", event, key);
        self.queue.add(key).await;
        self.metrics.set_queue_depth(self.queue.len().await);
    }

    /// 处理给定的监听事件流，直到流结束或被取消
    pub async fn run_stream<S>(&self, stream: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<Deployment>, watcher::Error>>,
    {
        futures::pin_mut!(stream);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Deployment 监听器已停止");
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    for notification in self.cache.apply(event).await {
                        self.handle(notification).await;
                    }
                    self.metrics.set_cached_objects(self.cache.len());
                    self.metrics.set_cache_synced(self.cache.is_synced());
                }
                // 监听器会按退避策略自行重连
                Some(Err(e)) => error!("Deployment 监听器错误: {}", e),
                None => {
                    warn!("Deployment 监听流已结束");
                    return;
                }
            }
        }
    }
}
