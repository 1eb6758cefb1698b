//! 传输抽象：发送端、接收端与工厂。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 分发代码只面向 [`Sender`] / [`Receiver`] 契约，内存队列、Broker 客户端或数据库轮询
//!   可以在装配阶段互换，而无需改动管线与处理器；
//! - 接收端只依赖 [`InboundProcessor`]，不感知管线内部结构。
//!
//! ## 契约说明（What）
//! - `send` 为每个目的地址投递一份独立副本，逐地址报告结果，部分失败不会被吞掉；
//! - `start` 开始从单一地址拉取消息，每条消息调用一次入站处理器；
//! - `stop(timeout)` 停止新的出队，最多等待 `timeout` 让进行中的处理器结束，绝不超时等待；
//! - 拉取循环在就绪信号上挂起，被唤醒后一直出队到队列为空再重新等待。
//!
//! ## 风险提示（Trade-offs）
//! - 取消是协作式的：`stop` 超时后仍在运行的处理器不会被中止，只在 [`StopReport`] 中计数。

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    CoreError, Result, error::codes, message::Envelope, pipeline::InboundProcessor,
};

/// 单个地址的投递失败。
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DeliveryFailure {
    /// 目标队列当前拒绝入队。
    #[error("queue `{address}` is unavailable")]
    QueueUnavailable { address: String },
}

impl DeliveryFailure {
    pub fn address(&self) -> &str {
        match self {
            DeliveryFailure::QueueUnavailable { address } => address,
        }
    }

    /// 对应的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryFailure::QueueUnavailable { .. } => codes::TRANSPORT_QUEUE_UNAVAILABLE,
        }
    }
}

impl From<DeliveryFailure> for CoreError {
    fn from(failure: DeliveryFailure) -> Self {
        CoreError::new(failure.code(), failure.to_string()).with_cause(failure)
    }
}

/// 一次发送的逐地址结果。
///
/// - `delivered`：成功入队的地址，按调用方给出的顺序；
/// - `failed`：失败的地址与原因。
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    /// 是否全部送达。
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// 存在失败地址时转为 `transport.partial_delivery` 错误，报告作为底层原因保留。
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_complete() {
            return Ok(self.delivered);
        }
        let failed: Vec<&str> = self.failed.iter().map(DeliveryFailure::address).collect();
        let message = format!(
            "delivered to {} address(es), failed for [{}]",
            self.delivered.len(),
            failed.join(", ")
        );
        Err(CoreError::new(codes::TRANSPORT_PARTIAL_DELIVERY, message)
            .with_cause(PartialDelivery(self)))
    }
}

/// 包装部分失败的报告，作为错误原因保留完整信息。
#[derive(Debug, thiserror::Error)]
#[error("{} of {} destination(s) failed", .0.failed.len(), .0.failed.len() + .0.delivered.len())]
pub struct PartialDelivery(pub DeliveryReport);

/// 去重后的目的地址，保持首次出现的顺序。
pub fn distinct_destinations(destinations: &[String]) -> Vec<&str> {
    let mut seen: Vec<&str> = Vec::with_capacity(destinations.len());
    for address in destinations {
        if !seen.contains(&address.as_str()) {
            seen.push(address);
        }
    }
    seen
}

/// 发送端契约。
#[async_trait]
pub trait Sender: Send + Sync + 'static {
    /// 向每个目的地址投递一份独立的信封副本，重复地址只投递一次。
    async fn send(&self, envelope: Envelope, destinations: &[String]) -> Result<DeliveryReport>;
}

/// `stop` 的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StopReport {
    /// 在超时之前是否所有处理器都已结束。
    pub drained: bool,
    /// 超时时仍在运行的处理器数量。
    pub in_flight: usize,
    /// 实际等待时长。
    pub elapsed: Duration,
}

/// 接收端契约。
#[async_trait]
pub trait Receiver: Send + Sync + 'static {
    /// 拉取的地址。
    fn address(&self) -> &str;

    /// 启动拉取循环；重复启动返回 `transport.already_started`。
    async fn start(&self) -> Result<()>;

    /// 停止拉取并等待进行中的处理器，最多等待 `timeout`。
    async fn stop(&self, timeout: Duration) -> Result<StopReport>;
}

/// 接收端选项。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// 拉取的地址。
    pub address: String,
    /// 并发处理上限，`0` 表示只出队不执行管线。
    pub max_concurrency: usize,
    /// 首次失败后的额外尝试次数。
    pub max_retries: u32,
    /// 重试耗尽后的转储地址，缺省为 `<address>.poison`。
    pub poison_address: Option<String>,
}

impl ReceiverOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            max_concurrency: 1,
            max_retries: 0,
            poison_address: None,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_poison_address(mut self, poison_address: impl Into<String>) -> Self {
        self.poison_address = Some(poison_address.into());
        self
    }

    /// 实际使用的毒消息地址。
    pub fn resolved_poison_address(&self) -> String {
        self.poison_address
            .clone()
            .unwrap_or_else(|| format!("{}.poison", self.address))
    }

    /// 校验选项。
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                "receiver address must not be empty",
            ));
        }
        Ok(())
    }
}

/// 传输工厂，宿主通过它创建发送端与接收端。
pub trait TransportFactory: Send + Sync + 'static {
    /// 传输名称，用于日志。
    fn name(&self) -> &str;

    fn create_sender(&self) -> Result<Arc<dyn Sender>>;

    fn create_receiver(
        &self,
        options: ReceiverOptions,
        processor: Arc<dyn InboundProcessor>,
    ) -> Result<Arc<dyn Receiver>>;
}

impl fmt::Debug for dyn TransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFactory")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations_are_deduplicated_in_order() {
        let input = vec!["b".to_owned(), "a".to_owned(), "b".to_owned()];
        assert_eq!(distinct_destinations(&input), ["b", "a"]);
    }

    #[test]
    fn partial_report_becomes_error() {
        let report = DeliveryReport {
            delivered: vec!["a".into()],
            failed: vec![DeliveryFailure::QueueUnavailable {
                address: "b".into(),
            }],
        };
        let err = report.into_result().err().expect("部分失败");
        assert_eq!(err.code(), codes::TRANSPORT_PARTIAL_DELIVERY);
        assert!(err.message().contains("[b]"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn unavailable_queue_maps_to_retryable_code() {
        let failure = DeliveryFailure::QueueUnavailable {
            address: "orders".into(),
        };
        assert_eq!(failure.address(), "orders");
        let err = CoreError::from(failure);
        assert_eq!(err.code(), codes::TRANSPORT_QUEUE_UNAVAILABLE);
        assert!(err.category().is_retryable());
        assert!(err.message().contains("orders"));
    }

    #[test]
    fn poison_address_defaults_to_suffix() {
        let options = ReceiverOptions::new("orders");
        assert_eq!(options.resolved_poison_address(), "orders.poison");
        let options = options.with_poison_address("dead");
        assert_eq!(options.resolved_poison_address(), "dead");
    }
}
