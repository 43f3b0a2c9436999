//! 资源归属模型
//!
//! 控制器创建的 Service 和 Ingress 会带上归属标签，并通过 ownerReference
//! 指向源 Deployment。删除或复用已有资源前，必须先确认资源归本控制器管理。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 默认归属标签键
pub const DEFAULT_OWNER_LABEL_KEY: &str = "ekspose";

/// 默认归属标签值
pub const DEFAULT_OWNER_LABEL_VALUE: &str = "true";

/// 控制器名称，用作 field manager
pub const CONTROLLER_NAME: &str = "ekspose-controller";

/// 归属标签
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerLabel {
    /// 标签键
    pub key: String,
    /// 标签值
    pub value: String,
}

impl Default for OwnerLabel {
    fn default() -> Self {
        Self {
            key: DEFAULT_OWNER_LABEL_KEY.to_string(),
            value: DEFAULT_OWNER_LABEL_VALUE.to_string(),
        }
    }
}

impl OwnerLabel {
    /// 生成只包含归属标签的标签集合
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.key.clone(), self.value.clone())])
    }

    /// 检查标签集合是否带有归属标签
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        labels
            .and_then(|labels| labels.get(&self.key))
            .map(|value| value == &self.value)
            .unwrap_or(false)
    }
}
