//! # TeleDerm Core
//!
//! 远程皮肤科问诊平台的核心模块，提供基础数据结构、错误定义、
//! 费用计算和通用工具。

pub mod error;
pub mod fee;
pub mod models;
pub mod utils;

pub use error::{Result, TeledermError};
pub use models::*;
