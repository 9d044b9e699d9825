//! 日志初始化

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// 初始化全局tracing订阅器
///
/// `RUST_LOG` 优先于配置里的级别串。重复初始化返回错误，由
/// 调用方决定是否忽略（测试里常见）。
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing subscriber: {}", e))?;
    Ok(())
}
