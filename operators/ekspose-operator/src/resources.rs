//! 期望资源模块
//!
//! 根据 Deployment 推导出期望的 Service 与 Ingress，并判断集群中已有的
//! 同名资源是否归本控制器管理。

use ekspose_common::{OwnerLabel, ReconcileKey};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use std::collections::BTreeMap;

use crate::config::{IngressConfig, OperatorConfig, ServiceConfig};

/// 已有资源的归属状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// 归属当前 Deployment
    Current,
    /// 归属同名的旧 Deployment，携带旧的 owner uid
    Stale(String),
    /// 不归本控制器管理
    Foreign,
}

/// 期望资源构建器
#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    /// 归属标签
    owner_label: OwnerLabel,
    /// Service 配置
    service: ServiceConfig,
    /// Ingress 配置
    ingress: IngressConfig,
}

impl ResourceBuilder {
    /// 创建新的构建器
    pub fn new(config: &OperatorConfig) -> Self {
        Self {
            owner_label: config.owner_label.clone(),
            service: config.service.clone(),
            ingress: config.ingress.clone(),
        }
    }

    /// 归属标签
    pub fn owner_label(&self) -> &OwnerLabel {
        &self.owner_label
    }

    /// 构建期望的 Service
    ///
    /// 选择器直接使用 Pod 模板标签。标签为空时选择器也为空，不做校验。
    pub fn desired_service(&self, key: &ReconcileKey, deployment: &Deployment) -> Service {
        Service {
            metadata: self.owned_metadata(key, deployment),
            spec: Some(ServiceSpec {
                selector: Some(pod_template_labels(deployment)),
                ports: Some(vec![ServicePort {
                    name: Some(self.service.port_name.clone()),
                    port: self.service.port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 根据 Service 构建期望的 Ingress
    pub fn desired_ingress(&self, service: &Service) -> Ingress {
        let path = HTTPIngressPath {
            path: Some(self.ingress.path.clone()),
            path_type: self.ingress.path_type.clone(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: service.metadata.name.clone().unwrap_or_default(),
                    port: Some(ServiceBackendPort {
                        number: Some(self.service.port),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        };

        Ingress {
            metadata: ObjectMeta {
                name: service.metadata.name.clone(),
                namespace: service.metadata.namespace.clone(),
                labels: service.metadata.labels.clone(),
                owner_references: service.metadata.owner_references.clone(),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: self.ingress.class_name.clone(),
                rules: Some(vec![IngressRule {
                    http: Some(HTTPIngressRuleValue { paths: vec![path] }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 判断资源是否归本控制器管理
    ///
    /// 资源必须带有归属标签。若资源声明了控制者 ownerReference，
    /// 它必须指向同名的 Deployment。
    pub fn is_owned(&self, key: &ReconcileKey, meta: &ObjectMeta) -> bool {
        if !self.owner_label.matches(meta.labels.as_ref()) {
            return false;
        }

        let controller = meta
            .owner_references
            .iter()
            .flatten()
            .find(|owner| owner.controller == Some(true));

        match controller {
            Some(owner) => owner.kind == "Deployment" && owner.name == key.name,
            None => true,
        }
    }

    /// 判断同名资源相对于当前 Deployment 的归属状态
    ///
    /// 归属本控制器、但控制者 ownerReference 指向已被删除的同名旧 Deployment
    /// 的资源为 [`Ownership::Stale`]，垃圾回收随时可能删除它。
    pub fn ownership(
        &self,
        key: &ReconcileKey,
        meta: &ObjectMeta,
        deployment: &Deployment,
    ) -> Ownership {
        if !self.is_owned(key, meta) {
            return Ownership::Foreign;
        }

        let controller = meta
            .owner_references
            .iter()
            .flatten()
            .find(|owner| owner.controller == Some(true));

        match (controller, deployment.metadata.uid.as_deref()) {
            (Some(owner), Some(uid)) if owner.uid != uid => Ownership::Stale(owner.uid.clone()),
            _ => Ownership::Current,
        }
    }

    fn owned_metadata(&self, key: &ReconcileKey, deployment: &Deployment) -> ObjectMeta {
        ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: Some(self.owner_label.to_labels()),
            // 缺少 uid 的对象无法生成 ownerReference
            owner_references: deployment.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        }
    }
}

/// 获取 Deployment 的 Pod 模板标签
pub fn pod_template_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default()
}
