//! 可观测性：tracing 日志初始化

use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    init_with_default(LevelFilter::INFO.into());
}

pub fn init_with_default(default: Directive) {
    let filter = EnvFilter::builder()
        .with_default_directive(default)
        .from_env_lossy();

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}
