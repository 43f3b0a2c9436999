//! 配置管理模块
//!
//! 该模块负责加载控制器配置。配置按以下顺序叠加，后者覆盖前者：
//! 内置默认值、YAML/JSON 配置文件、`EKSPOSE__` 前缀的环境变量。

use anyhow::{anyhow, bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use ekspose_common::OwnerLabel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// 控制器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// 监听的命名空间，为空时监听所有命名空间
    pub namespace: Option<String>,
    /// Deployment 标签选择器
    pub label_selector: Option<String>,
    /// 协调 worker 数量
    pub workers: usize,
    /// 日志级别
    pub log_level: String,
    /// 等待缓存同步的超时时间（秒），0 表示一直等待
    pub sync_timeout_secs: u64,
    /// Deployment 更新时是否也触发协调
    pub reconcile_on_update: bool,
    /// 永久性错误的最大重试次数，为空表示一直重试
    pub max_permanent_retries: Option<u32>,
    /// 归属标签
    pub owner_label: OwnerLabel,
    /// Service 配置
    pub service: ServiceConfig,
    /// Ingress 配置
    pub ingress: IngressConfig,
    /// 退避重试配置
    pub backoff: BackoffConfig,
    /// 指标与健康检查服务器配置
    pub metrics: MetricsConfig,
}

/// Service 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// 端口名称
    pub port_name: String,
    /// 端口号
    pub port: i32,
}

/// Ingress 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// IngressClass 名称
    pub class_name: Option<String>,
    /// 路由路径
    pub path: String,
    /// 路径类型：Prefix、Exact 或 ImplementationSpecific
    pub path_type: String,
}

/// 退避重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// 首次重试延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大重试延迟（秒）
    pub max_delay_secs: u64,
}

/// 指标服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 是否启用
    pub enabled: bool,
    /// 监听地址
    pub listen_address: String,
    /// 监听端口
    pub port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            workers: 1,
            log_level: "info".to_string(),
            sync_timeout_secs: 0,
            reconcile_on_update: false,
            max_permanent_retries: None,
            owner_label: OwnerLabel::default(),
            service: ServiceConfig::default(),
            ingress: IngressConfig::default(),
            backoff: BackoffConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port_name: "http".to_string(),
            port: 80,
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            class_name: Some("ingress".to_string()),
            path: "/nginx".to_string(),
            path_type: "Prefix".to_string(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_secs: 300,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl BackoffConfig {
    /// 首次重试延迟
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// 最大重试延迟
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

impl OperatorConfig {
    /// 加载配置
    ///
    /// 未指定配置文件时只使用默认值和环境变量。
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&OperatorConfig::default()).context("序列化默认配置失败")?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = config_path {
            let config_file = path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;

            // 确定配置文件格式
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => bail!("不支持的配置文件格式，仅支持 YAML 或 JSON: {:?}", path),
            };

            debug!("加载配置文件: {}", config_file);
            builder = builder.add_source(File::with_name(config_file).format(format));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("EKSPOSE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("构建配置失败")?;

        let operator_config = config
            .try_deserialize::<OperatorConfig>()
            .context("配置格式错误")?;

        operator_config.validate()?;
        Ok(operator_config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers 必须大于 0");
        }

        if !(1..=65535).contains(&self.service.port) {
            bail!("Service 端口超出范围: {}", self.service.port);
        }

        if self.service.port_name.is_empty() {
            bail!("Service 端口名称不能为空");
        }

        if !self.ingress.path.starts_with('/') {
            bail!("Ingress 路径必须以 '/' 开头: {}", self.ingress.path);
        }

        match self.ingress.path_type.as_str() {
            "Prefix" | "Exact" | "ImplementationSpecific" => {}
            other => bail!("不支持的 Ingress 路径类型: {}", other),
        }

        if self.owner_label.key.is_empty() {
            bail!("归属标签键不能为空");
        }

        if self.backoff.base_delay() > self.backoff.max_delay() {
            bail!("首次重试延迟不能大于最大重试延迟");
        }

        Ok(())
    }

    /// 等待缓存同步的超时时间
    pub fn sync_timeout(&self) -> Option<Duration> {
        match self.sync_timeout_secs {
            0 => None,
            n => Some(Duration::from_secs(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = OperatorConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.service.port_name, "http");
        assert_eq!(config.service.port, 80);
        assert_eq!(config.ingress.path, "/nginx");
        assert_eq!(config.ingress.path_type, "Prefix");
        assert_eq!(config.ingress.class_name.as_deref(), Some("ingress"));
        assert_eq!(config.owner_label, OwnerLabel::default());
        assert!(config.max_permanent_retries.is_none());
        assert!(config.sync_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "namespace: apps\nworkers: 4\ningress:\n  path: /web\nbackoff:\n  max_delay_secs: 60"
        )
        .unwrap();

        let config = OperatorConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.namespace.as_deref(), Some("apps"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.ingress.path, "/web");
        // 未覆盖的字段保持默认值
        assert_eq!(config.ingress.path_type, "Prefix");
        assert_eq!(config.service.port, 80);
        assert_eq!(config.backoff.max_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "max_permanent_retries: 1\nservice:\n  port_name: file").unwrap();

        // 只使用其他测试不关心的字段，避免并行测试互相影响
        std::env::set_var("EKSPOSE__MAX_PERMANENT_RETRIES", "7");
        std::env::set_var("EKSPOSE__SERVICE__PORT_NAME", "web");
        let config = OperatorConfig::load(Some(file.path()));
        std::env::remove_var("EKSPOSE__MAX_PERMANENT_RETRIES");
        std::env::remove_var("EKSPOSE__SERVICE__PORT_NAME");

        let config = config.unwrap();
        assert_eq!(config.max_permanent_retries, Some(7));
        assert_eq!(config.service.port_name, "web");
        // 未被环境变量覆盖的字段保持默认值
        assert_eq!(config.service.port, 80);
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        assert!(OperatorConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = OperatorConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.ingress.path = "nginx".to_string();
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.ingress.path_type = "Regex".to_string();
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.backoff.base_delay_ms = 10_000;
        config.backoff.max_delay_secs = 1;
        assert!(config.validate().is_err());
    }
}
