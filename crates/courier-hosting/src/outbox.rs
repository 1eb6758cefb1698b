use std::{fmt, sync::Arc};

use async_trait::async_trait;

use courier_core::{
    ChainOutcome, CompiledPipeline, CoreError, DeliveryReport, Envelope, ErrorCategory,
    InboundProcessor, Logger, Message, MessageContext, PipelineInbound, ResolutionScope, Result,
    Sender, ServiceInstance, ServiceResolver, TransportMetadata, TypeKey, codes, headers,
};

/// 出站句柄：以本端点的身份发送消息。
///
/// - 每条出站信封都带上 `courier-return-address`，值为本端点地址，接收方据此回复；
/// - 克隆只复制内部 `Arc`，可以放进处理器的闭包或解析作用域。
#[derive(Clone)]
pub struct Outbox {
    sender: Arc<dyn Sender>,
    local_address: Arc<str>,
    logger: Logger,
}

impl Outbox {
    pub(crate) fn new(sender: Arc<dyn Sender>, local_address: &str, logger: Logger) -> Self {
        Self {
            sender,
            local_address: Arc::from(local_address),
            logger,
        }
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// 发送到给定地址，逐地址报告结果。
    pub async fn send<M: Message>(
        &self,
        message: M,
        addresses: &[String],
    ) -> Result<DeliveryReport> {
        self.send_envelope(Envelope::new(message), addresses).await
    }

    pub async fn send_envelope(
        &self,
        mut envelope: Envelope,
        addresses: &[String],
    ) -> Result<DeliveryReport> {
        if !envelope.headers().contains(headers::RETURN_ADDRESS) {
            envelope
                .headers_mut()
                .insert(headers::RETURN_ADDRESS, &*self.local_address);
        }
        let report = self.sender.send(envelope, addresses).await?;
        if !report.is_complete() {
            tracing::warn!(
                parent: self.logger.span(),
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "partial delivery"
            );
        }
        Ok(report)
    }

    /// 发送到本端点自己的地址。
    pub async fn send_local<M: Message>(&self, message: M) -> Result<()> {
        let addresses = [self.local_address.to_string()];
        self.send(message, &addresses).await?.into_result().map(drop)
    }

    /// 回复当前消息的发送方；上下文没有回复地址时返回 `transport.no_reply_address`。
    pub async fn reply<M: Message>(&self, ctx: &MessageContext, message: M) -> Result<()> {
        let address = ctx.reply_address().ok_or_else(no_reply_address)?.to_owned();
        let mut envelope = Envelope::new(message);
        if let Some(id) = ctx.envelope().message_id() {
            envelope.headers_mut().insert(headers::CORRELATION_ID, id);
        }
        self.send_envelope(envelope, &[address])
            .await?
            .into_result()
            .map(drop)
    }
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("local_address", &self.local_address)
            .finish()
    }
}

fn no_reply_address() -> CoreError {
    CoreError::new(
        codes::TRANSPORT_NO_REPLY_ADDRESS,
        "incoming message carries no reply address",
    )
    .with_category(ErrorCategory::NonRetryable)
}

/// 单条入站消息的会话，处理器可以从解析作用域中取得它。
///
/// 除了 [`Outbox`] 的发送能力外，会话还记住了入站消息的回复地址与编号，
/// 因此处理器不接触 [`MessageContext`] 也能回复。
#[derive(Clone, Debug)]
pub struct MessageSession {
    outbox: Outbox,
    reply_to: Option<String>,
    message_id: Option<String>,
}

impl MessageSession {
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub async fn send<M: Message>(
        &self,
        message: M,
        addresses: &[String],
    ) -> Result<DeliveryReport> {
        self.outbox.send(message, addresses).await
    }

    pub async fn send_local<M: Message>(&self, message: M) -> Result<()> {
        self.outbox.send_local(message).await
    }

    pub async fn reply<M: Message>(&self, message: M) -> Result<()> {
        let address = self.reply_to.clone().ok_or_else(no_reply_address)?;
        let mut envelope = Envelope::new(message);
        if let Some(id) = &self.message_id {
            envelope.headers_mut().insert(headers::CORRELATION_ID, id.as_str());
        }
        self.outbox
            .send_envelope(envelope, &[address])
            .await?
            .into_result()
            .map(drop)
    }
}

/// 在应用作用域之上叠加 [`MessageSession`] 的解析作用域。
struct SessionScope {
    session: ServiceInstance,
    inner: Box<dyn ResolutionScope>,
}

impl ResolutionScope for SessionScope {
    fn resolve(&self, key: TypeKey) -> Result<ServiceInstance> {
        if key == TypeKey::of::<MessageSession>() {
            return Ok(Arc::clone(&self.session));
        }
        self.inner.resolve(key)
    }
}

/// 总线的入站处理器：在应用作用域之上叠加会话，再交给 [`PipelineInbound`] 执行管线。
pub(crate) struct BusInbound {
    inbound: PipelineInbound,
    outbox: Outbox,
}

impl BusInbound {
    pub(crate) fn new(inbound: PipelineInbound, outbox: Outbox) -> Self {
        Self { inbound, outbox }
    }

    pub(crate) fn pipeline(&self) -> &CompiledPipeline {
        self.inbound.pipeline()
    }
}

#[async_trait]
impl InboundProcessor for BusInbound {
    async fn process(
        &self,
        envelope: Envelope,
        transport: TransportMetadata,
    ) -> Result<ChainOutcome> {
        let session = MessageSession {
            outbox: self.outbox.clone(),
            reply_to: transport
                .reply_to
                .clone()
                .or_else(|| envelope.headers().get(headers::RETURN_ADDRESS).map(str::to_owned)),
            message_id: envelope.message_id().map(str::to_owned),
        };
        let scope = SessionScope {
            session: Arc::new(session),
            inner: self.inbound.resolver().create_scope(),
        };
        self.inbound
            .run_in_scope(envelope, Box::new(scope), transport)
            .await
    }
}
