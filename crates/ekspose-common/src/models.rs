//! 数据模型模块
//!
//! 该模块定义了 Ekspose 中使用的核心数据模型，包括协调键和资源归属标签。

pub mod key;
pub mod ownership;
