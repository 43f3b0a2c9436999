//! 平台客户端模块
//!
//! 该模块封装了控制器对 Kubernetes API 的全部调用：读取 Deployment，
//! 以及 Service 与 Ingress 的查询、创建和删除。协调器只依赖 [`PlatformClient`]
//! trait，生产环境使用 [`KubePlatform`]，测试中替换为内存实现或 mock。

use async_trait::async_trait;
use ekspose_common::{Error, ReconcileKey, Result, CONTROLLER_NAME};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::{Api, DeleteParams, PostParams, Preconditions},
    client::Client,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

/// 平台客户端
///
/// 所有调用都以 (namespace, name) 定位资源，失败时返回带类别的 [`Error`]。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// 读取 Deployment，不存在时返回 `None`
    async fn get_deployment(&self, key: &ReconcileKey) -> Result<Option<Deployment>>;

    /// 读取 Service，不存在时返回 `None`
    async fn get_service(&self, key: &ReconcileKey) -> Result<Option<Service>>;

    /// 创建 Service，已存在时返回 `Error::AlreadyExists`
    async fn create_service(&self, key: &ReconcileKey, service: &Service) -> Result<()>;

    /// 删除 Service，不存在时返回 `Error::NotFound`
    ///
    /// 指定 uid 时只删除该 uid 对应的对象。
    async fn delete_service(&self, key: &ReconcileKey, uid: Option<String>) -> Result<()>;

    /// 读取 Ingress，不存在时返回 `None`
    async fn get_ingress(&self, key: &ReconcileKey) -> Result<Option<Ingress>>;

    /// 创建 Ingress，已存在时返回 `Error::AlreadyExists`
    async fn create_ingress(&self, key: &ReconcileKey, ingress: &Ingress) -> Result<()>;

    /// 删除 Ingress，不存在时返回 `Error::NotFound`
    async fn delete_ingress(&self, key: &ReconcileKey, uid: Option<String>) -> Result<()>;
}

/// 基于 kube-rs 的平台客户端
#[derive(Clone)]
pub struct KubePlatform {
    /// Kubernetes 客户端
    client: Client,
}

impl KubePlatform {
    /// 创建新的平台客户端
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, key: &ReconcileKey) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    async fn get_opt<K>(&self, kind: &str, key: &ReconcileKey) -> Result<Option<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(key);
        match api.get(&key.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(e) => Err(classify(e, kind, key)),
        }
    }

    async fn create<K>(&self, kind: &str, key: &ReconcileKey, obj: &K) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + serde::Serialize
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(key);
        let params = PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        };

        api.create(&params, obj)
            .await
            .map_err(|e| classify(e, kind, key))?;

        debug!("已创建 {} {}", kind, key);
        Ok(())
    }

    async fn delete<K>(&self, kind: &str, key: &ReconcileKey, uid: Option<String>) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(key);
        let params = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid),
                resource_version: None,
            }),
            ..Default::default()
        };

        api.delete(&key.name, &params)
            .await
            .map_err(|e| classify(e, kind, key))?;

        debug!("已删除 {} {}", kind, key);
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for KubePlatform {
    async fn get_deployment(&self, key: &ReconcileKey) -> Result<Option<Deployment>> {
        self.get_opt("Deployment", key).await
    }

    async fn get_service(&self, key: &ReconcileKey) -> Result<Option<Service>> {
        self.get_opt("Service", key).await
    }

    async fn create_service(&self, key: &ReconcileKey, service: &Service) -> Result<()> {
        self.create("Service", key, service).await
    }

    async fn delete_service(&self, key: &ReconcileKey, uid: Option<String>) -> Result<()> {
        self.delete::<Service>("Service", key, uid).await
    }

    async fn get_ingress(&self, key: &ReconcileKey) -> Result<Option<Ingress>> {
        self.get_opt("Ingress", key).await
    }

    async fn create_ingress(&self, key: &ReconcileKey, ingress: &Ingress) -> Result<()> {
        self.create("Ingress", key, ingress).await
    }

    async fn delete_ingress(&self, key: &ReconcileKey, uid: Option<String>) -> Result<()> {
        self.delete::<Ingress>("Ingress", key, uid).await
    }
}

/// 将 kube-rs 错误归类
///
/// 404 为资源不存在，409 且原因为 AlreadyExists 为资源已存在。
/// 其余 409、408、429、5xx 以及传输层错误为暂时性错误，其他 4xx 和请求构造、
/// 反序列化错误为永久性错误。
pub fn classify(err: kube::Error, kind: &str, key: &ReconcileKey) -> Error {
    let target = format!("{} {}", kind, key);

    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => Error::NotFound(target),
            409 if resp.reason == "AlreadyExists" => Error::AlreadyExists(target),
            408 | 409 | 429 => Error::Transient(format!("{}: {}", target, resp.message)),
            code if code >= 500 => Error::Transient(format!("{}: {}", target, resp.message)),
            code => Error::Permanent(format!("{}: {} ({} {})", target, resp.message, code, resp.reason)),
        },
        kube::Error::SerdeError(e) => Error::Permanent(format!("{}: {}", target, e)),
        kube::Error::BuildRequest(e) => Error::Permanent(format!("{}: {}", target, e)),
        other => Error::Transient(format!("{}: {}", target, other)),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! 内存平台客户端，供协调器测试使用

    use super::*;
    use ekspose_common::ErrorKind;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// 内存中的集群状态
    #[derive(Default)]
    pub(crate) struct FakeState {
        pub deployments: HashMap<ReconcileKey, Deployment>,
        pub services: HashMap<ReconcileKey, Service>,
        pub ingresses: HashMap<ReconcileKey, Ingress>,
        /// 调用记录，例如 "delete_service default/web"
        pub calls: Vec<String>,
        /// 按方法名注入的故障
        pub failures: HashMap<&'static str, ErrorKind>,
    }

    /// 内存平台客户端
    #[derive(Default)]
    pub(crate) struct FakePlatform {
        pub state: Mutex<FakeState>,
    }

    impl FakePlatform {
        pub fn insert_deployment(&self, deployment: Deployment) {
            let key = ReconcileKey::from_parts(
                deployment.metadata.namespace.as_deref(),
                deployment.metadata.name.as_deref(),
            )
            .unwrap();
            self.state.lock().unwrap().deployments.insert(key, deployment);
        }

        pub fn remove_deployment(&self, key: &ReconcileKey) {
            self.state.lock().unwrap().deployments.remove(key);
        }

        pub fn fail(&self, method: &'static str, kind: ErrorKind) {
            self.state.lock().unwrap().failures.insert(method, kind);
        }

        pub fn heal(&self, method: &'static str) {
            self.state.lock().unwrap().failures.remove(method);
        }

        pub fn service(&self, key: &ReconcileKey) -> Option<Service> {
            self.state.lock().unwrap().services.get(key).cloned()
        }

        pub fn ingress(&self, key: &ReconcileKey) -> Option<Ingress> {
            self.state.lock().unwrap().ingresses.get(key).cloned()
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn record(&self, method: &'static str, key: &ReconcileKey) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("{} {}", method, key));
            match state.failures.get(method) {
                Some(ErrorKind::NotFound) => Err(Error::NotFound(key.to_string())),
                Some(ErrorKind::AlreadyExists) => Err(Error::AlreadyExists(key.to_string())),
                Some(ErrorKind::Transient) => Err(Error::Transient(format!("{} 注入故障", method))),
                Some(ErrorKind::Permanent) => Err(Error::Permanent(format!("{} 注入故障", method))),
                None => Ok(()),
            }
        }
    }

    fn uid_matches(meta_uid: Option<&String>, uid: &Option<String>) -> bool {
        match uid {
            Some(uid) => meta_uid == Some(uid),
            None => true,
        }
    }

    #[async_trait]
    impl PlatformClient for FakePlatform {
        async fn get_deployment(&self, key: &ReconcileKey) -> Result<Option<Deployment>> {
            self.record("get_deployment", key)?;
            Ok(self.state.lock().unwrap().deployments.get(key).cloned())
        }

        async fn get_service(&self, key: &ReconcileKey) -> Result<Option<Service>> {
            self.record("get_service", key)?;
            Ok(self.service(key))
        }

        async fn create_service(&self, key: &ReconcileKey, service: &Service) -> Result<()> {
            self.record("create_service", key)?;
            let mut state = self.state.lock().unwrap();
            if state.services.contains_key(key) {
                return Err(Error::AlreadyExists(format!("Service {}", key)));
            }
            let mut service = service.clone();
            service.metadata.uid = Some(format!("svc-{}", key));
            state.services.insert(key.clone(), service);
            Ok(())
        }

        async fn delete_service(&self, key: &ReconcileKey, uid: Option<String>) -> Result<()> {
            self.record("delete_service", key)?;
            let mut state = self.state.lock().unwrap();
            match state.services.get(key) {
                None => Err(Error::NotFound(format!("Service {}", key))),
                Some(svc) if !uid_matches(svc.metadata.uid.as_ref(), &uid) => {
                    Err(Error::Transient(format!("Service {} uid 不匹配", key)))
                }
                Some(_) => {
                    state.services.remove(key);
                    Ok(())
                }
            }
        }

        async fn get_ingress(&self, key: &ReconcileKey) -> Result<Option<Ingress>> {
            self.record("get_ingress", key)?;
            Ok(self.ingress(key))
        }

        async fn create_ingress(&self, key: &ReconcileKey, ingress: &Ingress) -> Result<()> {
            self.record("create_ingress", key)?;
            let mut state = self.state.lock().unwrap();
            if state.ingresses.contains_key(key) {
                return Err(Error::AlreadyExists(format!("Ingress {}", key)));
            }
            let mut ingress = ingress.clone();
            ingress.metadata.uid = Some(format!("ing-{}", key));
            state.ingresses.insert(key.clone(), ingress);
            Ok(())
        }

        async fn delete_ingress(&self, key: &ReconcileKey, uid: Option<String>) -> Result<()> {
            self.record("delete_ingress", key)?;
            let mut state = self.state.lock().unwrap();
            match state.ingresses.get(key) {
                None => Err(Error::NotFound(format!("Ingress {}", key))),
                Some(ing) if !uid_matches(ing.metadata.uid.as_ref(), &uid) => {
                    Err(Error::Transient(format!("Ingress {} uid 不匹配", key)))
                }
                Some(_) => {
                    state.ingresses.remove(key);
                    Ok(())
                }
            }
        }
    }
}
