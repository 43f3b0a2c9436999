//! 错误处理模块
//!
//! 该模块提供 Ekspose 的统一错误类型。每个错误都归入一个错误类别，
//! 协调器根据类别决定视为成功、退避重试，还是按永久性错误处理。

use std::io;
use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 资源不存在
    NotFound,
    /// 资源已存在
    AlreadyExists,
    /// 暂时性错误（网络、服务端 5xx、限流），应当重试
    Transient,
    /// 永久性错误（请求格式错误、权限不足），重试无法自行恢复
    Permanent,
}

impl ErrorKind {
    /// 指标标签使用的名称
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        }
    }
}

/// Ekspose 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 资源不存在
    #[error("资源不存在: {0}")]
    NotFound(String),

    /// 资源已存在
    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    /// 暂时性错误
    #[error("暂时性错误: {0}")]
    Transient(String),

    /// 永久性错误
    #[error("永久性错误: {0}")]
    Permanent(String),

    /// 同名资源存在但不归本控制器管理
    #[error("资源 {0} 不归本控制器管理")]
    NotOwned(String),

    /// 无效的协调键
    #[error("无效的协调键: {0}")]
    InvalidKey(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 获取错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Transient(_) | Error::Io(_) => ErrorKind::Transient,
            Error::Permanent(_)
            | Error::NotOwned(_)
            | Error::InvalidKey(_)
            | Error::Config(_)
            | Error::Json(_) => ErrorKind::Permanent,
        }
    }

    /// 是否为资源不存在
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// 是否为资源已存在
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// 是否为永久性错误
    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Permanent
    }
}

/// Ekspose 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(Error::NotFound("default/web".into()).is_not_found());
        assert!(Error::AlreadyExists("default/web".into()).is_already_exists());
        assert_eq!(Error::Transient("timeout".into()).kind(), ErrorKind::Transient);
        assert!(Error::NotOwned("Service default/web".into()).is_permanent());
        assert!(Error::InvalidKey("web".into()).is_permanent());

        let io = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(io.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_kind_metric_names() {
        assert_eq!(ErrorKind::AlreadyExists.as_str(), "already_exists");
        assert_eq!(ErrorKind::Permanent.as_str(), "permanent");
    }
}
