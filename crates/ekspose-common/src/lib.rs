//! Ekspose Common - 跨模块共享的数据结构与错误类型
//!
//! 该模块提供 Ekspose 控制器使用的协调键、资源归属标签以及统一的错误处理机制。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::ErrorKind;
pub use error::Result;
pub use models::key::*;
pub use models::ownership::*;
