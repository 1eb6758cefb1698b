use std::{borrow::Cow, error::Error, fmt, time::Duration};

/// 底层原因的对象安全表示。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// `CoreError` 是总线各层共享的稳定错误形态。
///
/// # 设计背景（Why）
/// - 管线、分发表、传输与 Broker 在不同层次产生的故障需要合流为统一的错误码，
///   接收端才能据此决定重试、投递到毒消息队列或直接关闭连接。
/// - 错误码使用 `<域>.<语义>` 的 `'static` 字符串，日志与告警可直接按码聚合。
///
/// # 契约说明（What）
/// - `code`：稳定错误码，取值见 [`codes`]；
/// - `message`：面向排障人员的描述，不应包含敏感信息；
/// - `cause`：可选底层原因，通过 [`Error::source`] 暴露；
/// - `category`：显式设置的处置分类，未设置时按错误码查表。
///
/// # 风险提示（Trade-offs）
/// - 结构体只承载信息，不做日志输出；调用方需在合适的层级记录。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

impl CoreError {
    /// 构造核心错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 附带底层原因并返回新的错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 显式标记处置分类，覆盖错误码的默认映射。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 处置分类。
    ///
    /// # 执行逻辑（How）
    /// 1. 优先返回通过 [`with_category`](Self::with_category) 显式设置的值；
    /// 2. 否则按错误码前缀查表：传输类故障默认可重试，协议类为协议违例，其余不可重试。
    pub fn category(&self) -> ErrorCategory {
        self.category
            .clone()
            .unwrap_or_else(|| default_category(self.code))
    }

    /// 错误在分类学中的位置，由错误码决定。
    pub fn kind(&self) -> ErrorKind {
        codes::kind_of(self.code)
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 描述文本。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 管线续调契约被破坏。
    pub fn chain_violation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::PIPELINE_CHAIN_VIOLATION, message)
    }

    /// 处理器参数无法从解析作用域获得，消息中携带缺失的类型名。
    pub fn resolution_failure(type_name: &str) -> Self {
        Self::new(
            codes::DISPATCH_RESOLUTION_FAILED,
            format!("no service registered for `{type_name}`"),
        )
    }

    /// 处理器自身执行失败。
    pub fn handler_failure(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::DISPATCH_HANDLER_FAILED, message)
    }

    /// 连接层收到无法解析的帧。
    pub fn protocol_failure(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::PROTOCOL_MALFORMED_FRAME, message)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

/// 错误分类学，对应总线的五类故障加上装配期的配置错误。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Behavior 破坏了“至多调用一次 next”的契约，仅在诊断模式下产生。
    ChainViolation,
    /// 处理器参数无法从解析作用域获得。
    ResolutionFailure,
    /// 处理器执行失败。
    HandlerFailure,
    /// 发送或接收路径上的 I/O 故障。
    TransportFailure,
    /// 连接层的畸形帧，由协议读取器上报。
    ProtocolFailure,
    /// 配置缺失或取值非法。
    Configuration,
}

/// 错误的处置分类，驱动接收端的重试与连接关闭策略。
///
/// # 契约说明（What）
/// - `Retryable`：可在给定延迟后重试，`None` 表示立即重试；
/// - `NonRetryable`：重试无意义；
/// - `Cancelled` / `Timeout`：由停止或截止时间触发；
/// - `ProtocolViolation`：对端违反协议，连接应被关闭。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Retryable(Option<Duration>),
    NonRetryable,
    Cancelled,
    Timeout,
    ProtocolViolation,
}

impl ErrorCategory {
    /// 是否允许重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Retryable(_))
    }
}

fn default_category(code: &str) -> ErrorCategory {
    match codes::kind_of(code) {
        ErrorKind::TransportFailure => ErrorCategory::Retryable(None),
        ErrorKind::ProtocolFailure => ErrorCategory::ProtocolViolation,
        // 处理器失败由接收端的重试预算决定，而非在这里一票否决。
        ErrorKind::HandlerFailure | ErrorKind::ResolutionFailure => ErrorCategory::Retryable(None),
        ErrorKind::ChainViolation | ErrorKind::Configuration => ErrorCategory::NonRetryable,
    }
}

/// 稳定错误码集合。
///
/// 命名遵循 `<域>.<语义>`，域前缀决定 [`ErrorKind`]。
pub mod codes {
    use super::ErrorKind;

    pub const PIPELINE_CHAIN_VIOLATION: &str = "pipeline.chain_violation";
    pub const PIPELINE_DUPLICATE_BEHAVIOR: &str = "pipeline.duplicate_behavior";

    pub const DISPATCH_RESOLUTION_FAILED: &str = "dispatch.resolution_failed";
    pub const DISPATCH_HANDLER_FAILED: &str = "dispatch.handler_failed";
    pub const DISPATCH_ARGUMENT_MISMATCH: &str = "dispatch.argument_mismatch";
    pub const DISPATCH_NO_HANDLER: &str = "dispatch.no_handler";

    pub const TRANSPORT_QUEUE_UNAVAILABLE: &str = "transport.queue_unavailable";
    pub const TRANSPORT_PARTIAL_DELIVERY: &str = "transport.partial_delivery";
    pub const TRANSPORT_ALREADY_STARTED: &str = "transport.already_started";
    pub const TRANSPORT_IO: &str = "transport.io";
    pub const TRANSPORT_NO_REPLY_ADDRESS: &str = "transport.no_reply_address";

    pub const BUFFER_POOL_EXHAUSTED: &str = "buffer.pool_exhausted";
    pub const BUFFER_POOL_CLOSED: &str = "buffer.pool_closed";

    pub const PROTOCOL_MALFORMED_FRAME: &str = "protocol.malformed_frame";

    pub const CONFIG_INVALID: &str = "config.invalid";

    /// 根据错误码前缀推导分类学位置；未知前缀按处理器失败处理。
    pub fn kind_of(code: &str) -> ErrorKind {
        match code.split_once('.').map(|(domain, _)| domain) {
            Some("pipeline") if code == PIPELINE_CHAIN_VIOLATION => ErrorKind::ChainViolation,
            Some("pipeline") => ErrorKind::Configuration,
            Some("dispatch") if code == DISPATCH_RESOLUTION_FAILED => {
                ErrorKind::ResolutionFailure
            }
            Some("transport") | Some("buffer") => ErrorKind::TransportFailure,
            Some("protocol") => ErrorKind::ProtocolFailure,
            Some("config") => ErrorKind::Configuration,
            _ => ErrorKind::HandlerFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_code_domain() {
        assert_eq!(
            CoreError::resolution_failure("Clock").kind(),
            ErrorKind::ResolutionFailure
        );
        assert_eq!(
            CoreError::handler_failure("boom").kind(),
            ErrorKind::HandlerFailure
        );
        assert_eq!(
            CoreError::new(codes::BUFFER_POOL_EXHAUSTED, "full").kind(),
            ErrorKind::TransportFailure
        );
        assert_eq!(
            CoreError::protocol_failure("bad frame").kind(),
            ErrorKind::ProtocolFailure
        );
        assert_eq!(
            CoreError::new("app.custom", "x").kind(),
            ErrorKind::HandlerFailure
        );
    }

    #[test]
    fn explicit_category_wins_over_default() {
        let err = CoreError::new(codes::TRANSPORT_IO, "reset");
        assert!(err.category().is_retryable());
        let err = err.with_category(ErrorCategory::NonRetryable);
        assert_eq!(err.category(), ErrorCategory::NonRetryable);
    }

    #[test]
    fn resolution_failure_names_missing_type() {
        let err = CoreError::resolution_failure("app::Clock");
        assert!(err.message().contains("app::Clock"));
        assert_eq!(
            err.to_string(),
            "[dispatch.resolution_failed] no service registered for `app::Clock`"
        );
    }
}
