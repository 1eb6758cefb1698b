use std::sync::Arc;

use courier_core::{
    InboundProcessor, LoggerRegistry, Result,
    transport::{Receiver, ReceiverOptions, Sender, TransportFactory},
};

use crate::{
    network::InMemoryNetwork,
    receiver::{InMemoryReceiver, ReceiveListener},
    sender::InMemorySender,
};

/// 进程内传输工厂。
///
/// 同一工厂创建的发送端与接收端共享一个 [`InMemoryNetwork`]；日志组件名按
/// `transport.memory.<角色>` 从注册表取得，重复创建时复用同一个 span。
#[derive(Clone, Debug, Default)]
pub struct InMemoryTransport {
    network: InMemoryNetwork,
    loggers: LoggerRegistry,
}

impl InMemoryTransport {
    pub const NAME: &'static str = "memory";

    pub fn new(network: InMemoryNetwork) -> Self {
        Self {
            network,
            loggers: LoggerRegistry::new(),
        }
    }

    /// 使用进程级共享网络。
    pub fn shared() -> Self {
        Self::new(InMemoryNetwork::shared())
    }

    pub fn with_loggers(mut self, loggers: LoggerRegistry) -> Self {
        self.loggers = loggers;
        self
    }

    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }

    /// 创建接收端并附带只出队模式下的监听回调。
    pub fn create_receiver_with_listener(
        &self,
        options: ReceiverOptions,
        processor: Arc<dyn InboundProcessor>,
        listener: ReceiveListener,
    ) -> Result<Arc<InMemoryReceiver>> {
        self.build_receiver(options, processor, Some(listener))
    }

    fn build_receiver(
        &self,
        options: ReceiverOptions,
        processor: Arc<dyn InboundProcessor>,
        listener: Option<ReceiveListener>,
    ) -> Result<Arc<InMemoryReceiver>> {
        let logger = self
            .loggers
            .logger(&format!("transport.memory.receiver.{}", options.address));
        InMemoryReceiver::new(self.network.clone(), options, processor, listener, logger)
            .map(Arc::new)
    }
}

impl TransportFactory for InMemoryTransport {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create_sender(&self) -> Result<Arc<dyn Sender>> {
        let logger = self.loggers.logger("transport.memory.sender");
        Ok(Arc::new(InMemorySender::new(self.network.clone(), logger)))
    }

    fn create_receiver(
        &self,
        options: ReceiverOptions,
        processor: Arc<dyn InboundProcessor>,
    ) -> Result<Arc<dyn Receiver>> {
        let receiver: Arc<dyn Receiver> = self.build_receiver(options, processor, None)?;
        Ok(receiver)
    }
}
