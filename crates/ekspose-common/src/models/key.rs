//! 协调键模型
//!
//! 协调键由命名空间和名称组成，用于在工作队列中标识待协调的 Deployment。
//! 协调键不持有任何对象引用，即使对象已从集群中删除，键依然有效。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// 协调键
///
/// 字符串格式为：namespace/name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconcileKey {
    /// 命名空间
    pub namespace: String,
    /// 资源名称
    pub name: String,
}

impl ReconcileKey {
    /// 创建新的协调键
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();

        if namespace.is_empty() {
            return Err(Error::InvalidKey("命名空间不能为空".to_string()));
        }

        if name.is_empty() {
            return Err(Error::InvalidKey("名称不能为空".to_string()));
        }

        if namespace.contains('/') || name.contains('/') {
            return Err(Error::InvalidKey(format!(
                "命名空间和名称不能包含 '/': {}/{}",
                namespace, name
            )));
        }

        Ok(Self { namespace, name })
    }

    /// 从可选的元数据字段构建协调键
    ///
    /// 监听事件中的对象元数据字段均为可选，集群范围的对象没有命名空间，
    /// 这类对象无法生成协调键。
    pub fn from_parts(namespace: Option<&str>, name: Option<&str>) -> Result<Self> {
        let namespace = namespace.ok_or_else(|| Error::InvalidKey("对象缺少命名空间".to_string()))?;
        let name = name.ok_or_else(|| Error::InvalidKey("对象缺少名称".to_string()))?;
        Self::new(namespace, name)
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ReconcileKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace, name) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidKey(format!("协调键格式应为 namespace/name: {}", s)))?;
        Self::new(namespace, name)
    }
}
