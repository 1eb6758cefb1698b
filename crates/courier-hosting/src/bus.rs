use std::{
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use courier_broker::Broker;
use courier_core::{
    DeliveryReport, Envelope, Logger, Message, MessageContext, Receiver, Result, StopReport,
};

use crate::{
    config::BusConfig,
    outbox::{BusInbound, Outbox},
};

/// `Bus::stop` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusStopReport {
    pub receiver: StopReport,
    /// 未配置 Broker 时为 `None`。
    pub broker: Option<StopReport>,
}

impl BusStopReport {
    /// 接收端与 Broker 是否都在时限内排空。
    pub fn drained(&self) -> bool {
        self.receiver.drained && self.broker.is_none_or(|broker| broker.drained)
    }
}

/// 装配完成的消息总线。
///
/// # 教案级注释
/// - **意图 (Why)**：对外只暴露 `start` / `stop` 两个控制入口与一组发送方法，
///   接收端、管线与 Broker 的生命周期都收拢在这里。
/// - **执行逻辑 (How)**：
///   1. `start` 先启动接收端，再启动 Broker；Broker 启动失败时尽力停止接收端后返回原错误；
///   2. `stop` 先停接收端再停 Broker，两者共享同一个总时限。
/// - **契约 (What)**：
///   - `send` 逐地址报告投递结果，部分失败不会被转成成功；
///   - `send_local` 与 `reply` 要求全部投递成功，否则返回 `transport.partial_delivery`。
pub struct Bus {
    config: BusConfig,
    outbox: Outbox,
    receiver: Arc<dyn Receiver>,
    broker: Option<Broker>,
    inbound: Arc<BusInbound>,
    logger: Logger,
}

impl Bus {
    pub(crate) fn new(
        config: BusConfig,
        outbox: Outbox,
        receiver: Arc<dyn Receiver>,
        broker: Option<Broker>,
        inbound: Arc<BusInbound>,
        logger: Logger,
    ) -> Self {
        Self {
            config,
            outbox,
            receiver,
            broker,
            inbound,
            logger,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn address(&self) -> &str {
        self.outbox.local_address()
    }

    /// 出站句柄，可以交给总线之外的任务使用。
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// 管线中的 Behavior 名称，按执行顺序排列，最后一个总是分发。
    pub fn behavior_names(&self) -> Vec<String> {
        self.inbound
            .pipeline()
            .descriptors()
            .into_iter()
            .map(|descriptor| descriptor.name().to_owned())
            .collect()
    }

    /// Broker 正在运行时的监听地址。
    pub fn broker_addr(&self) -> Option<SocketAddr> {
        self.broker.as_ref().and_then(Broker::local_addr)
    }

    pub fn broker(&self) -> Option<&Broker> {
        self.broker.as_ref()
    }

    pub async fn start(&self) -> Result<()> {
        self.receiver.start().await?;
        if let Some(broker) = &self.broker {
            if let Err(err) = broker.start().await {
                if let Err(teardown) = self.receiver.stop(self.config.shutdown_timeout()).await {
                    tracing::warn!(
                        parent: self.logger.span(),
                        error = %teardown,
                        "receiver teardown after broker failure failed"
                    );
                }
                return Err(err);
            }
        }
        tracing::info!(
            parent: self.logger.span(),
            address = %self.address(),
            max_concurrency = self.config.max_concurrency,
            broker = ?self.broker_addr(),
            "bus started"
        );
        Ok(())
    }

    pub async fn stop(&self, timeout: Duration) -> Result<BusStopReport> {
        let started = Instant::now();
        let receiver = self.receiver.stop(timeout).await?;
        let broker = match &self.broker {
            Some(broker) => Some(broker.stop(timeout.saturating_sub(started.elapsed())).await?),
            None => None,
        };
        let report = BusStopReport { receiver, broker };
        tracing::info!(
            parent: self.logger.span(),
            address = %self.address(),
            drained = report.drained(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "bus stopped"
        );
        Ok(report)
    }

    /// 以配置中的 `shutdown_timeout_ms` 停止。
    pub async fn shutdown(&self) -> Result<BusStopReport> {
        self.stop(self.config.shutdown_timeout()).await
    }

    pub async fn send<M: Message>(
        &self,
        message: M,
        addresses: &[String],
    ) -> Result<DeliveryReport> {
        self.outbox.send(message, addresses).await
    }

    pub async fn send_envelope(
        &self,
        envelope: Envelope,
        addresses: &[String],
    ) -> Result<DeliveryReport> {
        self.outbox.send_envelope(envelope, addresses).await
    }

    pub async fn send_local<M: Message>(&self, message: M) -> Result<()> {
        self.outbox.send_local(message).await
    }

    pub async fn reply<M: Message>(&self, ctx: &MessageContext, message: M) -> Result<()> {
        self.outbox.reply(ctx, message).await
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("address", &self.address())
            .field("behaviors", &self.behavior_names())
            .field("broker", &self.broker_addr())
            .finish()
    }
}
