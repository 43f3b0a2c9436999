//! 资源协调模块
//!
//! 该模块实现控制器的收敛逻辑。对于每个协调键，先向 API 查询 Deployment
//! 当前是否存在，而不是相信触发协调的事件类型：
//! - 不存在时删除同名的 Service 和 Ingress
//! - 存在时按 Pod 模板标签创建 Service，再创建指向它的 Ingress
//!
//! 创建遇到已存在、删除遇到不存在都视为成功，因此重复协调是幂等的。

use ekspose_common::{Error, ErrorKind, ReconcileKey, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cache::ResourceCache;
use crate::platform::PlatformClient;
use crate::resources::{Ownership, ResourceBuilder};

/// 协调结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Deployment 存在，Service 与 Ingress 已就绪
    Converged,
    /// Deployment 不存在，Service 与 Ingress 已清理
    TornDown,
}

/// 失败后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// 按退避策略重新入队
    Requeue,
    /// 放弃该键
    Drop,
}

/// 协调器状态
#[derive(Default, Debug, Clone)]
pub struct ReconcilerState {
    /// 成功的协调次数
    pub reconciled: usize,
    /// 失败的协调次数
    pub failed: usize,
    /// 上次协调时间
    pub last_reconcile_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// 协调器结构体
pub struct Reconciler {
    /// 平台客户端
    platform: Arc<dyn PlatformClient>,
    /// Deployment 本地缓存
    cache: Arc<ResourceCache>,
    /// 期望资源构建器
    builder: ResourceBuilder,
    /// 永久性错误的最大重试次数
    max_permanent_retries: Option<u32>,
    /// 协调状态
    state: RwLock<ReconcilerState>,
    /// 每个键连续的永久性错误次数
    permanent_failures: Mutex<HashMap<ReconcileKey, u32>>,
}

impl Reconciler {
    /// 创建新的协调器
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        cache: Arc<ResourceCache>,
        builder: ResourceBuilder,
        max_permanent_retries: Option<u32>,
    ) -> Self {
        Self {
            platform,
            cache,
            builder,
            max_permanent_retries,
            state: RwLock::new(ReconcilerState::default()),
            permanent_failures: Mutex::new(HashMap::new()),
        }
    }

    /// 协调一个键
    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<Outcome> {
        let result = self.reconcile_inner(key).await;

        let mut state = self.state.write().await;
        state.last_reconcile_time = Some(chrono::Utc::now());
        match &result {
            Ok(_) => state.reconciled += 1,
            Err(_) => state.failed += 1,
        }

        result
    }

    async fn reconcile_inner(&self, key: &ReconcileKey) -> Result<Outcome> {
        // 以 API 为准，缓存可能尚未看到最新的删除
        let deployment = self.platform.get_deployment(key).await?;

        let cached = self.cache.get(key).is_some();
        if cached != deployment.is_some() {
            debug!(
                "Deployment {} 缓存状态与 API 不一致: cache={}, api={}",
                key,
                cached,
                deployment.is_some()
            );
        }

        match deployment {
            None => {
                info!("Deployment {} 不存在，清理 Service 与 Ingress", key);
                self.teardown(key).await?;
                Ok(Outcome::TornDown)
            }
            Some(deployment) => {
                debug!("Deployment {} 存在，确保 Service 与 Ingress", key);
                self.converge(key, &deployment).await?;
                Ok(Outcome::Converged)
            }
        }
    }

    /// 清理路径
    ///
    /// 两个删除都会尝试，Service 删除失败不影响 Ingress 删除，
    /// 之后返回第一个失败。
    async fn teardown(&self, key: &ReconcileKey) -> Result<()> {
        let service_result = self.delete_service(key).await;
        if let Err(e) = &service_result {
            warn!("删除 Service {} 失败: {}", key, e);
        }

        let ingress_result = self.delete_ingress(key).await;
        if let Err(e) = &ingress_result {
            warn!("删除 Ingress {} 失败: {}", key, e);
        }

        service_result.and(ingress_result)
    }

    async fn delete_service(&self, key: &ReconcileKey) -> Result<()> {
        let service = match self.platform.get_service(key).await? {
            Some(service) => service,
            None => {
                debug!("Service {} 不存在，无需删除", key);
                return Ok(());
            }
        };

        if !self.builder.is_owned(key, &service.metadata) {
            warn!("Service {} 不归本控制器管理，跳过删除", key);
            return Ok(());
        }

        match self.platform.delete_service(key, service.metadata.uid.clone()).await {
            Ok(()) => {
                info!("已删除 Service {}", key);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_ingress(&self, key: &ReconcileKey) -> Result<()> {
        let ingress = match self.platform.get_ingress(key).await? {
            Some(ingress) => ingress,
            None => {
                debug!("Ingress {} 不存在，无需删除", key);
                return Ok(());
            }
        };

        if !self.builder.is_owned(key, &ingress.metadata) {
            warn!("Ingress {} 不归本控制器管理，跳过删除", key);
            return Ok(());
        }

        match self.platform.delete_ingress(key, ingress.metadata.uid.clone()).await {
            Ok(()) => {
                info!("已删除 Ingress {}", key);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 收敛路径
    ///
    /// Service 就绪后才创建 Ingress。
    async fn converge(&self, key: &ReconcileKey, deployment: &Deployment) -> Result<()> {
        let service = self.builder.desired_service(key, deployment);
        self.ensure_service(key, &service, deployment).await?;

        let ingress = self.builder.desired_ingress(&service);
        self.ensure_ingress(key, &ingress, deployment).await
    }

    async fn ensure_service(
        &self,
        key: &ReconcileKey,
        service: &Service,
        deployment: &Deployment,
    ) -> Result<()> {
        match self.platform.create_service(key, service).await {
            Ok(()) => {
                info!("已创建 Service {}", key);
                return Ok(());
            }
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }

        // 同名资源已存在，只有归属当前 Deployment 时才算收敛
        let existing = match self.platform.get_service(key).await? {
            Some(existing) => existing,
            None => return Err(Error::Transient(format!("Service {} 创建冲突后消失", key))),
        };

        match self.builder.ownership(key, &existing.metadata, deployment) {
            Ownership::Current => {
                debug!("Service {} 已存在", key);
                Ok(())
            }
            Ownership::Foreign => Err(Error::NotOwned(format!("Service {}", key))),
            Ownership::Stale(owner_uid) => {
                info!("Service {} 属于已删除的 Deployment ({})，重新创建", key, owner_uid);
                match self.platform.delete_service(key, existing.metadata.uid.clone()).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                self.platform
                    .create_service(key, service)
                    .await
                    .map_err(|e| conflict_as_transient(e, "Service", key))?;
                info!("已重新创建 Service {}", key);
                Ok(())
            }
        }
    }

    async fn ensure_ingress(
        &self,
        key: &ReconcileKey,
        ingress: &Ingress,
        deployment: &Deployment,
    ) -> Result<()> {
        match self.platform.create_ingress(key, ingress).await {
            Ok(()) => {
                info!("已创建 Ingress {}", key);
                return Ok(());
            }
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }

        let existing = match self.platform.get_ingress(key).await? {
            Some(existing) => existing,
            None => return Err(Error::Transient(format!("Ingress {} 创建冲突后消失", key))),
        };

        match self.builder.ownership(key, &existing.metadata, deployment) {
            Ownership::Current => {
                debug!("Ingress {} 已存在", key);
                Ok(())
            }
            Ownership::Foreign => Err(Error::NotOwned(format!("Ingress {}", key))),
            Ownership::Stale(owner_uid) => {
                info!("Ingress {} 属于已删除的 Deployment ({})，重新创建", key, owner_uid);
                match self.platform.delete_ingress(key, existing.metadata.uid.clone()).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                self.platform
                    .create_ingress(key, ingress)
                    .await
                    .map_err(|e| conflict_as_transient(e, "Ingress", key))?;
                info!("已重新创建 Ingress {}", key);
                Ok(())
            }
        }
    }

    /// 处理错误
    ///
    /// 默认所有错误都重新入队。配置了永久性错误重试上限时，
    /// 永久性错误的重试次数达到上限后该键被放弃。
    /// 只有永久性错误计入上限，临时错误不计。
    pub async fn handle_error(&self, key: &ReconcileKey, error: &Error) -> ErrorAction {
        match error.kind() {
            ErrorKind::Permanent => {
                let mut failures = self.permanent_failures.lock().await;
                let retries = failures.entry(key.clone()).or_insert(0);
                if let Some(max) = self.max_permanent_retries {
                    if *retries >= max {
                        error!("协调 {} 永久性失败 {} 次后放弃: {}", key, *retries + 1, error);
                        failures.remove(key);
                        return ErrorAction::Drop;
                    }
                }
                *retries += 1;
                error!("协调 {} 失败（永久性错误，第 {} 次）: {}", key, *retries, error);
                ErrorAction::Requeue
            }
            _ => {
                warn!("协调 {} 失败: {}", key, error);
                ErrorAction::Requeue
            }
        }
    }

    /// 清除键的永久性错误计数
    pub async fn forget(&self, key: &ReconcileKey) {
        self.permanent_failures.lock().await.remove(key);
    }

    /// 获取协调器状态
    pub async fn get_state(&self) -> ReconcilerState {
        self.state.read().await.clone()
    }
}

/// 重建时仍然冲突说明旧资源尚未删除完成，稍后重试即可
fn conflict_as_transient(error: Error, kind: &str, key: &ReconcileKey) -> Error {
    if error.is_already_exists() {
        Error::Transient(format!("{} {} 仍在删除中", kind, key))
    } else {
        error
    }
}
