//! 日志初始化
//!
//! 默认 `info` 级别，可通过 `RUST_LOG` 覆盖（如 `RUST_LOG=chat_vault_lib=debug`）。

use std::sync::Once;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// 初始化全局 tracing 订阅者，重复调用无副作用
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();
        // 宿主进程可能已安装订阅者
        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .is_err()
        {
            tracing::debug!("[Logging] 全局订阅者已存在，跳过初始化");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!("[Logging] test message");
    }
}
