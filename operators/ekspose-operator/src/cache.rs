//! Deployment 本地缓存模块
//!
//! 该模块在 kube-rs reflector store 之上维护 Deployment 的本地只读镜像，
//! 把监听事件转换为新增、更新、删除通知，并提供首次同步完成的信号。

use ekspose_common::ReconcileKey;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::{
    reflector::{self, store::Writer, ObjectRef, Store},
    watcher,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 缓存变更通知
#[derive(Debug, Clone)]
pub enum Notification {
    /// 对象首次出现
    Added(Arc<Deployment>),
    /// 已有对象被修改
    Updated(Arc<Deployment>),
    /// 对象被删除，携带缓存中最后一次看到的状态
    Deleted(Arc<Deployment>),
}

impl Notification {
    /// 通知携带的对象
    pub fn object(&self) -> &Deployment {
        match self {
            Notification::Added(obj) | Notification::Updated(obj) | Notification::Deleted(obj) => obj,
        }
    }
}

/// Deployment 本地缓存
pub struct ResourceCache {
    /// 只读视图
    store: Store<Deployment>,
    /// 写入端，只由监听任务使用
    writer: Mutex<Writer<Deployment>>,
    /// 首次同步完成信号
    synced: watch::Sender<bool>,
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCache {
    /// 创建空缓存
    pub fn new() -> Self {
        let (store, writer) = reflector::store();
        let (synced, _) = watch::channel(false);

        Self {
            store,
            writer: Mutex::new(writer),
            synced,
        }
    }

    /// 按协调键读取缓存中的 Deployment
    pub fn get(&self, key: &ReconcileKey) -> Option<Arc<Deployment>> {
        self.store
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }

    /// 缓存中的对象数量
    pub fn len(&self) -> usize {
        self.store.state().len()
    }

    /// 缓存是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否已完成首次同步
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// 等待首次同步完成
    ///
    /// 同步完成返回 `true`，在此之前被取消返回 `false`。
    pub async fn wait_until_synced(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.synced.subscribe();

        let wait = async move {
            loop {
                if *rx.borrow_and_update() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };

        tokio::select! {
            synced = wait => synced,
            _ = cancel.cancelled() => false,
        }
    }

    /// 应用一个监听事件，返回由此产生的变更通知
    ///
    /// 重新列举时，旧列表中有而新列表中没有的对象会产生删除通知，
    /// 这样监听中断期间发生的删除不会丢失。
    pub async fn apply(&self, event: watcher::Event<Deployment>) -> Vec<Notification> {
        let mut writer = self.writer.lock().await;

        let notifications = match &event {
            watcher::Event::Applied(obj) => {
                let existed = self.store.get(&ObjectRef::from_obj(obj)).is_some();
                let obj = Arc::new(obj.clone());
                if existed {
                    vec![Notification::Updated(obj)]
                } else {
                    vec![Notification::Added(obj)]
                }
            }
            watcher::Event::Deleted(obj) => {
                vec![Notification::Deleted(Arc::new(obj.clone()))]
            }
            watcher::Event::Restarted(objs) => {
                let previous = self.store.state();
                let current: HashSet<ObjectRef<Deployment>> =
                    objs.iter().map(ObjectRef::from_obj).collect();
                let previous_refs: HashSet<ObjectRef<Deployment>> =
                    previous.iter().map(|obj| ObjectRef::from_obj(obj.as_ref())).collect();

                let mut notifications: Vec<Notification> = objs
                    .iter()
                    .map(|obj| {
                        let obj_ref = ObjectRef::from_obj(obj);
                        let obj = Arc::new(obj.clone());
                        if previous_refs.contains(&obj_ref) {
                            Notification::Updated(obj)
                        } else {
                            Notification::Added(obj)
                        }
                    })
                    .collect();

                notifications.extend(
                    previous
                        .into_iter()
                        .filter(|obj| !current.contains(&ObjectRef::from_obj(obj.as_ref())))
                        .map(Notification::Deleted),
                );

                debug!(
                    "Deployment 重新列举: {} 个对象, {} 个通知",
                    objs.len(),
                    notifications.len()
                );
                notifications
            }
        };

        writer.apply_watcher_event(&event);
        drop(writer);

        if matches!(event, watcher::Event::Restarted(_)) && !self.is_synced() {
            self.synced.send_replace(true);
            info!("Deployment 缓存首次同步完成，共 {} 个对象", self.len());
        }

        notifications
    }
}
