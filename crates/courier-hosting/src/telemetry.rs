use std::sync::OnceLock;

use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// 日志安装错误。
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("courier tracing subscriber is already installed")]
    AlreadyInstalled,
    #[error("a global tracing subscriber was installed by someone else")]
    SubscriberAlreadySet,
    #[error("failed to set global subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装进程级 `fmt + EnvFilter` 日志订阅者。
///
/// # 教案式说明
/// - **逻辑（How）**：
///   1. 拒绝重复安装，也拒绝覆盖外部已设置的订阅者；
///   2. 过滤规则优先取 `RUST_LOG`，缺省或非法时退回 `default_filter`，再退回 `info`；
///   3. 组装 `registry + EnvFilter + fmt` 并设置为全局订阅者。
/// - **契约（What）**：成功后所有组件经 [`courier_core::Logger`] 的 span 输出的事件都带有 `component` 字段。
pub fn install_tracing(default_filter: &str) -> Result<(), TelemetryError> {
    if INSTALLED.get().is_some() {
        return Err(TelemetryError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(default_filter))
        .with(tracing_subscriber::fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)?;
    INSTALLED
        .set(())
        .map_err(|_| TelemetryError::AlreadyInstalled)
}

fn build_env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
