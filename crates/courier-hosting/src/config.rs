//! 总线配置：TOML 文件到各层运行时选项的映射。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 宿主只读取一份配置，接收端、管线与 Broker 的选项都从这里派生，避免各层各自解析；
//! - 字段缺省值与下层选项类型的缺省值保持一致，最小配置只需要 `destination_address`。
//!
//! ## 契约（What）
//! - 未知字段直接报错，拼写错误不会被静默忽略；
//! - `validate` 在构建总线前调用，拒绝空地址、零连接上限与零块大小；
//! - `broker` 段缺省时不启动内置 Broker。
//!
//! ## 示例
//! ```toml
//! destination_address = "orders"
//! max_concurrency = 4
//! max_retries = 3
//!
//! [broker]
//! listen_port = 5672
//! max_connections = 64
//! buffer_block_size = 8192
//! overflow = "reject"
//! ```

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use courier_broker::{AcceptorOptions, DEFAULT_BROKER_PORT, OverflowPolicy};
use courier_core::{CoreError, PipelineOptions, ReceiverOptions, codes};

/// 配置加载与校验错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::new(codes::CONFIG_INVALID, err.to_string()).with_cause(err)
    }
}

/// 总线配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// 本端点接收消息的地址，`send_local` 也投递到这里。
    pub destination_address: String,
    /// 并发处理上限，`0` 表示只出队不执行管线。
    pub max_concurrency: usize,
    /// 首次失败后的额外尝试次数。
    pub max_retries: u32,
    /// 缺省为 `<destination_address>.poison`。
    pub poison_address: Option<String>,
    /// 打开管线的续调契约校验。
    pub diagnostics: bool,
    /// `Bus::shutdown` 使用的等待时长。
    pub shutdown_timeout_ms: u64,
    pub broker: Option<BrokerConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            destination_address: String::new(),
            max_concurrency: 1,
            max_retries: 0,
            poison_address: None,
            diagnostics: false,
            shutdown_timeout_ms: 5_000,
            broker: None,
        }
    }
}

/// 内置 Broker 的监听配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub listen_host: IpAddr,
    pub listen_port: u16,
    pub max_connections: usize,
    pub buffer_block_size: usize,
    pub overflow: OverflowSetting,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_BROKER_PORT,
            max_connections: AcceptorOptions::DEFAULT_MAX_CONNECTIONS,
            buffer_block_size: AcceptorOptions::DEFAULT_BLOCK_SIZE,
            overflow: OverflowSetting::Queue,
        }
    }
}

/// [`OverflowPolicy`] 的配置文件表示。
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverflowSetting {
    #[default]
    Queue,
    Reject,
}

impl From<OverflowSetting> for OverflowPolicy {
    fn from(setting: OverflowSetting) -> Self {
        match setting {
            OverflowSetting::Queue => OverflowPolicy::Queue,
            OverflowSetting::Reject => OverflowPolicy::Reject,
        }
    }
}

impl BusConfig {
    /// 以给定地址构造其余字段取缺省值的配置。
    pub fn for_address(destination_address: impl Into<String>) -> Self {
        Self {
            destination_address: destination_address.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destination_address.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "destination_address",
                reason: "must not be empty",
            });
        }
        if self
            .poison_address
            .as_deref()
            .is_some_and(|address| address.trim().is_empty())
        {
            return Err(ConfigError::Invalid {
                field: "poison_address",
                reason: "must not be empty when set",
            });
        }
        if let Some(broker) = &self.broker {
            if broker.max_connections == 0 {
                return Err(ConfigError::Invalid {
                    field: "broker.max_connections",
                    reason: "must be greater than zero",
                });
            }
            if broker.buffer_block_size == 0 {
                return Err(ConfigError::Invalid {
                    field: "broker.buffer_block_size",
                    reason: "must be greater than zero",
                });
            }
        }
        Ok(())
    }

    pub fn receiver_options(&self) -> ReceiverOptions {
        let options = ReceiverOptions::new(self.destination_address.clone())
            .with_max_concurrency(self.max_concurrency)
            .with_max_retries(self.max_retries);
        match &self.poison_address {
            Some(address) => options.with_poison_address(address.clone()),
            None => options,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            diagnostics: self.diagnostics,
        }
    }

    /// `broker` 段存在时的接入器选项。
    pub fn acceptor_options(&self) -> Option<AcceptorOptions> {
        self.broker.as_ref().map(|broker| {
            AcceptorOptions::new(SocketAddr::new(broker.listen_host, broker.listen_port))
                .with_max_connections(broker.max_connections)
                .with_buffer_block_size(broker.buffer_block_size)
                .with_overflow(broker.overflow.into())
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = BusConfig::from_toml_str(r#"destination_address = "Q""#).expect("最小配置");
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.max_retries, 0);
        assert!(config.acceptor_options().is_none());

        let options = config.receiver_options();
        assert_eq!(options.address, "Q");
        assert_eq!(options.resolved_poison_address(), "Q.poison");
    }

    #[test]
    fn broker_section_maps_to_acceptor_options() {
        let config = BusConfig::from_toml_str(
            r#"
            destination_address = "orders"
            max_concurrency = 0
            max_retries = 3
            poison_address = "orders.dead"

            [broker]
            listen_host = "127.0.0.1"
            max_connections = 8
            buffer_block_size = 512
            overflow = "reject"
            "#,
        )
        .expect("完整配置");

        let acceptor = config.acceptor_options().expect("存在 broker 段");
        assert_eq!(acceptor.listen_addr, SocketAddr::from(([127, 0, 0, 1], DEFAULT_BROKER_PORT)));
        assert_eq!(acceptor.max_connections, 8);
        assert_eq!(acceptor.buffer_block_size, 512);
        assert_eq!(acceptor.overflow, OverflowPolicy::Reject);

        let receiver = config.receiver_options();
        assert_eq!(receiver.max_concurrency, 0);
        assert_eq!(receiver.max_retries, 3);
        assert_eq!(receiver.resolved_poison_address(), "orders.dead");
    }

    #[test]
    fn invalid_values_name_the_field() {
        let err = BusConfig::from_toml_str(
            r#"
            destination_address = "orders"
            [broker]
            max_connections = 0
            "#,
        )
        .err()
        .expect("零连接上限");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "broker.max_connections",
                ..
            }
        ));

        let err = BusConfig::from_toml_str("").err().expect("缺少地址");
        assert!(err.to_string().contains("destination_address"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = BusConfig::from_toml_str(
            r#"
            destination_address = "orders"
            max_concurency = 4
            "#,
        )
        .err()
        .expect("拼写错误");
        assert!(matches!(err, ConfigError::Parse(_)));
        let core: CoreError = err.into();
        assert_eq!(core.code(), codes::CONFIG_INVALID);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = BusConfig::from_path("/nonexistent/courier.toml")
            .err()
            .expect("文件不存在");
        assert!(err.to_string().contains("/nonexistent/courier.toml"));
    }
}
