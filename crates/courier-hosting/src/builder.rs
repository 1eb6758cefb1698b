use std::{fmt, sync::Arc};

use courier_broker::{Broker, DrainReader, ProtocolReader};
use courier_core::{
    Behavior, DispatchBehavior, EmptyResolver, HandlerTableBuilder, LoggerRegistry,
    MissingHandlerPolicy, PipelineBuilder, PipelineInbound, Result, ServiceResolver,
    TransportFactory,
};
use courier_transport_memory::{InMemoryNetwork, InMemoryTransport};

use crate::{
    bus::Bus,
    config::BusConfig,
    outbox::{BusInbound, Outbox},
};

/// 总线装配器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把配置、Behavior、处理器、解析器与传输集中在一处装配，构建完成后全部冻结；
/// - 分发 Behavior 总是排在用户 Behavior 之后，成为管线的最内层。
///
/// ## 契约 (What)
/// - 未指定传输时使用进程级共享的 [`InMemoryNetwork`]；
/// - 未指定解析器时使用 [`EmptyResolver`]，处理器只能取得消息与会话；
/// - 配置含 `broker` 段而未指定读取器时，连接交给 [`DrainReader`]；
/// - Behavior 名称重复或配置非法时 `build` 失败，且不会创建任何接收端。
pub struct BusBuilder {
    config: BusConfig,
    pipeline: PipelineBuilder,
    handlers: HandlerTableBuilder,
    resolver: Arc<dyn ServiceResolver>,
    transport: Option<Arc<dyn TransportFactory>>,
    network: Option<InMemoryNetwork>,
    loggers: LoggerRegistry,
    missing_handler: MissingHandlerPolicy,
    reader: Option<Arc<dyn ProtocolReader>>,
}

impl BusBuilder {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            pipeline: PipelineBuilder::new(),
            handlers: HandlerTableBuilder::new(),
            resolver: Arc::new(EmptyResolver),
            transport: None,
            network: None,
            loggers: LoggerRegistry::new(),
            missing_handler: MissingHandlerPolicy::default(),
            reader: None,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// 在分发之前追加一个 Behavior。
    pub fn behavior(&mut self, behavior: Arc<dyn Behavior>) -> Result<&mut Self> {
        self.pipeline.register(behavior)?;
        Ok(self)
    }

    /// 处理器注册入口。
    pub fn handlers(&mut self) -> &mut HandlerTableBuilder {
        &mut self.handlers
    }

    pub fn resolver(&mut self, resolver: Arc<dyn ServiceResolver>) -> &mut Self {
        self.resolver = resolver;
        self
    }

    /// 使用自定义传输，覆盖先前的 [`network`](Self::network) 设置。
    pub fn transport(&mut self, transport: Arc<dyn TransportFactory>) -> &mut Self {
        self.transport = Some(transport);
        self.network = None;
        self
    }

    /// 使用给定网络上的进程内传输，覆盖先前的 [`transport`](Self::transport) 设置。
    ///
    /// 传输在 `build` 时才创建，因此总是使用最终设置的日志注册表。
    pub fn network(&mut self, network: InMemoryNetwork) -> &mut Self {
        self.network = Some(network);
        self.transport = None;
        self
    }

    pub fn loggers(&mut self, loggers: LoggerRegistry) -> &mut Self {
        self.loggers = loggers;
        self
    }

    pub fn missing_handler(&mut self, policy: MissingHandlerPolicy) -> &mut Self {
        self.missing_handler = policy;
        self
    }

    pub fn protocol_reader(&mut self, reader: Arc<dyn ProtocolReader>) -> &mut Self {
        self.reader = Some(reader);
        self
    }

    pub fn build(self) -> Result<Bus> {
        let Self {
            config,
            mut pipeline,
            handlers,
            resolver,
            transport,
            network,
            loggers,
            missing_handler,
            reader,
        } = self;
        config.validate()?;

        let table = Arc::new(handlers.build());
        let dispatch = DispatchBehavior::new(table, loggers.logger("dispatch"))
            .with_policy(missing_handler);
        pipeline
            .diagnostics(config.pipeline_options().diagnostics)
            .register(Arc::new(dispatch))?;
        let pipeline = pipeline.build();

        let transport = transport.unwrap_or_else(|| {
            let memory = network
                .map(InMemoryTransport::new)
                .unwrap_or_else(InMemoryTransport::shared);
            Arc::new(memory.with_loggers(loggers.clone())) as Arc<dyn TransportFactory>
        });
        let outbox = Outbox::new(
            transport.create_sender()?,
            &config.destination_address,
            loggers.logger("bus.outbox"),
        );
        let inbound = Arc::new(BusInbound::new(
            PipelineInbound::new(pipeline, resolver),
            outbox.clone(),
        ));
        let receiver = transport.create_receiver(config.receiver_options(), inbound.clone())?;

        let broker = match config.acceptor_options() {
            Some(options) => {
                let reader =
                    reader.unwrap_or_else(|| Arc::new(DrainReader) as Arc<dyn ProtocolReader>);
                Some(Broker::new(options, reader, loggers.logger("broker"))?)
            }
            None => None,
        };

        let logger = loggers.logger("bus");
        tracing::debug!(
            parent: logger.span(),
            address = %config.destination_address,
            transport = transport.name(),
            behaviors = inbound.pipeline().len(),
            broker = broker.is_some(),
            "bus assembled"
        );
        Ok(Bus::new(config, outbox, receiver, broker, inbound, logger))
    }
}

impl fmt::Debug for BusBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusBuilder")
            .field("config", &self.config)
            .field("behaviors", &self.pipeline.len())
            .field("handlers", &self.handlers.len())
            .field("missing_handler", &self.missing_handler)
            .finish()
    }
}
