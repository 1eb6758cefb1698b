//! 单条入站消息的处理上下文。

use std::{fmt, sync::Arc};

use crate::{
    Result,
    message::{Envelope, Headers, Message, TypeKey},
    resolve::{ResolutionScope, ServiceInstance},
};

/// 接收端附加的传输元数据。
///
/// - `source_address`：消息被取出的地址；
/// - `reply_to`：回复地址，缺省时回复无处可去；
/// - `delivery_attempt`：从 1 开始的投递次数，重试时递增。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportMetadata {
    pub source_address: String,
    pub reply_to: Option<String>,
    pub delivery_attempt: u32,
}

impl TransportMetadata {
    pub fn new(source_address: impl Into<String>) -> Self {
        Self {
            source_address: source_address.into(),
            reply_to: None,
            delivery_attempt: 1,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = attempt;
        self
    }
}

/// `MessageContext` 贯穿一次管线调用。
///
/// # 教案级注释
/// - **设计动机 (Why)**
///   - Behavior 与处理器需要同时访问信封、头部、解析作用域与传输元数据，
///     将它们收拢到一个独占对象中，链路上的每一环都以 `&mut` 借用它。
/// - **契约 (What)**
///   - 每条入站消息创建一次，由单次管线调用独占；
///   - 链路回卷后上下文被丢弃，所持有的解析作用域随之析构；
///   - 头部读写直接作用在信封上，回复或转发时会带出 Behavior 写入的头部。
pub struct MessageContext {
    envelope: Envelope,
    scope: Box<dyn ResolutionScope>,
    transport: TransportMetadata,
}

impl MessageContext {
    pub fn new(
        envelope: Envelope,
        scope: Box<dyn ResolutionScope>,
        transport: TransportMetadata,
    ) -> Self {
        Self {
            envelope,
            scope,
            transport,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn message(&self) -> &Arc<dyn Message> {
        self.envelope.message()
    }

    /// 下转型为具体消息类型。
    pub fn downcast<M: Message>(&self) -> Option<Arc<M>> {
        self.envelope.downcast::<M>()
    }

    pub fn headers(&self) -> &Headers {
        self.envelope.headers()
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        self.envelope.headers_mut()
    }

    pub fn scope(&self) -> &dyn ResolutionScope {
        self.scope.as_ref()
    }

    /// 从作用域解析服务。
    pub fn resolve(&self, key: TypeKey) -> Result<ServiceInstance> {
        self.scope.resolve(key)
    }

    pub fn transport(&self) -> &TransportMetadata {
        &self.transport
    }

    /// 回复地址：优先使用传输元数据，其次读取信封头部。
    pub fn reply_address(&self) -> Option<&str> {
        self.transport
            .reply_to
            .as_deref()
            .or_else(|| self.headers().get(crate::headers::RETURN_ADDRESS))
    }

    /// 取回信封，供重试或毒消息路由复用。
    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("envelope", &self.envelope)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{headers, resolve::EmptyResolver};

    #[derive(Debug)]
    struct Ping;

    impl Message for Ping {}

    #[test]
    fn reply_address_prefers_transport_metadata() {
        let envelope = Envelope::new(Ping).with_header(headers::RETURN_ADDRESS, "from-header");
        let ctx = MessageContext::new(
            envelope.clone(),
            Box::new(EmptyResolver),
            TransportMetadata::new("orders"),
        );
        assert_eq!(ctx.reply_address(), Some("from-header"));

        let ctx = MessageContext::new(
            envelope,
            Box::new(EmptyResolver),
            TransportMetadata::new("orders").with_reply_to("from-transport"),
        );
        assert_eq!(ctx.reply_address(), Some("from-transport"));
    }

    #[test]
    fn header_writes_reach_the_envelope() {
        let mut ctx = MessageContext::new(
            Envelope::new(Ping),
            Box::new(EmptyResolver),
            TransportMetadata::new("orders"),
        );
        ctx.headers_mut().insert("tenant", "acme");
        assert_eq!(ctx.into_envelope().headers().get("tenant"), Some("acme"));
    }
}
