use std::{any::Any, borrow::Cow, fmt, future::Future, sync::Arc};

use futures_util::future::BoxFuture;

use crate::{CoreError, Result, dispatch::Arguments, message::TypeKey};

/// 处理器返回值的统一形态。
#[derive(Clone)]
pub enum HandlerOutput {
    /// 无返回值的处理器。
    Unit,
    /// 带返回值的处理器，调用方自行下转型。
    Value(Arc<dyn Any + Send + Sync>),
}

impl HandlerOutput {
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        HandlerOutput::Value(Arc::new(value))
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, HandlerOutput::Unit)
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            HandlerOutput::Unit => None,
            HandlerOutput::Value(value) => Arc::clone(value).downcast::<T>().ok(),
        }
    }
}

impl fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOutput::Unit => f.write_str("Unit"),
            HandlerOutput::Value(_) => f.write_str("Value(..)"),
        }
    }
}

/// 把处理器的返回值规整为 [`HandlerOutput`]。
pub trait IntoHandlerOutput {
    fn into_output(self) -> HandlerOutput;
}

impl IntoHandlerOutput for () {
    fn into_output(self) -> HandlerOutput {
        HandlerOutput::Unit
    }
}

impl IntoHandlerOutput for HandlerOutput {
    fn into_output(self) -> HandlerOutput {
        self
    }
}

/// 预编译的调用入口：接收实参列表，返回处理器的异步结果。
pub type Invoker =
    Arc<dyn Fn(Arguments) -> BoxFuture<'static, Result<HandlerOutput>> + Send + Sync>;

/// 把返回 `Result<O>` 的异步闭包包装为 [`Invoker`] 所需的盒装 future。
pub(crate) fn boxed<Fut, O>(future: Fut) -> BoxFuture<'static, Result<HandlerOutput>>
where
    Fut: Future<Output = Result<O>> + Send + 'static,
    O: IntoHandlerOutput,
{
    Box::pin(async move { future.await.map(IntoHandlerOutput::into_output) })
}

/// 实参构造失败时的调用结果。
pub(crate) fn failed(err: CoreError) -> BoxFuture<'static, Result<HandlerOutput>> {
    Box::pin(async move { Err(err) })
}

/// 一条处理器注册记录。
///
/// # 教案级注释
/// - **契约 (What)**
///   - `message_type`：声明处理的消息类型或契约，分发时按可赋值关系匹配；
///   - `target`：可选目标类型，存在时从解析作用域取得并放在第 0 个实参槽位；
///   - `parameters`：按位置排列的参数类型，可由消息赋值的参数收到消息，其余从作用域解析；
///   - `ordinal`：注册序号，同一消息的多个处理器按它执行。
/// - **后置条件**：记录在 [`HandlerTableBuilder::build`](super::HandlerTableBuilder::build)
///   之后只读，`Invoker` 只在注册时构造一次。
#[derive(Clone)]
pub struct HandlerRegistration {
    label: Cow<'static, str>,
    message_type: TypeKey,
    target: Option<TypeKey>,
    parameters: Vec<TypeKey>,
    invoker: Invoker,
    ordinal: usize,
}

impl HandlerRegistration {
    pub(crate) fn new(
        label: Cow<'static, str>,
        message_type: TypeKey,
        target: Option<TypeKey>,
        parameters: Vec<TypeKey>,
        invoker: Invoker,
        ordinal: usize,
    ) -> Self {
        Self {
            label,
            message_type,
            target,
            parameters,
            invoker,
            ordinal,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn message_type(&self) -> TypeKey {
        self.message_type
    }

    pub fn target(&self) -> Option<TypeKey> {
        self.target
    }

    pub fn parameters(&self) -> &[TypeKey] {
        &self.parameters
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// 实参槽位数量，含目标实例。
    pub fn arity(&self) -> usize {
        self.parameters.len() + usize::from(self.target.is_some())
    }

    /// 以已构造好的实参调用处理器。
    pub fn invoke(&self, arguments: Arguments) -> BoxFuture<'static, Result<HandlerOutput>> {
        (self.invoker)(arguments)
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("label", &self.label)
            .field("message_type", &self.message_type)
            .field("target", &self.target)
            .field("parameters", &self.parameters)
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}
