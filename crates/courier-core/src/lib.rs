#![deny(unsafe_code)]
#![doc = "courier-core: 消息总线的核心契约。"]
#![doc = ""]
#![doc = "本 crate 定义消息模型、中间件管线、处理器分发表、服务解析作用域与传输抽象，"]
#![doc = "不包含任何具体传输实现；内存队列、Broker 与宿主分别位于独立 crate。"]
#![doc = ""]
#![doc = "== 数据流 =="]
#![doc = "入站：Receiver → `CompiledPipeline::invoke` → 用户 Behavior → `DispatchBehavior` → 处理器 → 回卷。"]
#![doc = "出站：调用方 → `Sender::send` → 具体传输的入队逻辑。"]

/// 重新导出 `async_trait`，实现 [`pipeline::Behavior`] 与传输契约时无需额外依赖。
pub use async_trait::async_trait;

pub mod context;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod prelude;
pub mod resolve;
pub mod sequence;
pub mod transport;

pub use context::{MessageContext, TransportMetadata};
pub use dispatch::{
    Argument, Arguments, DispatchBehavior, HandlerDispatchTable, HandlerOutput,
    HandlerRegistration, HandlerTableBuilder, MissingHandlerPolicy,
};
pub use error::{CoreError, ErrorCategory, ErrorKind, codes};
pub use logging::{Logger, LoggerRegistry};
pub use message::{ANY_MESSAGE, Envelope, Headers, Message, MessageIdentity, TypeKey, headers};
pub use pipeline::{
    Behavior, BehaviorDescriptor, ChainOutcome, CompiledPipeline, InboundProcessor, Next,
    PipelineBuilder, PipelineInbound, PipelineOptions,
};
pub use resolve::{EmptyResolver, ResolutionScope, ServiceInstance, ServiceMap, ServiceResolver};
pub use sequence::{AtomicSequence, SequenceNumber};
pub use transport::{
    DeliveryFailure, DeliveryReport, Receiver, ReceiverOptions, Sender, StopReport,
    TransportFactory,
};

/// 核心层统一的结果别名，错误类型默认为 [`CoreError`]。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;
