//! 处理器分发表。
//!
//! # 设计背景（Why）
//! - 处理器在装配阶段通过显式注册调用登记，注册时即把调用入口编译为闭包，
//!   运行期不依赖任何反射；
//! - 同一运行时类型的匹配结果只计算一次，之后直接命中缓存。
//!
//! # 契约说明（What）
//! - [`HandlerDispatchTable::dispatchers_for`] 返回所有“声明类型可由运行时类型赋值”的注册记录，
//!   顺序与注册顺序一致；
//! - [`HandlerDispatchTable::execute`] 构造实参：目标实例在前（若声明），随后逐个参数：
//!   可由消息赋值的参数收到消息，其余从作用域解析；缺失服务只中止本次处理器调用；
//! - 分发表在 [`HandlerTableBuilder::build`] 后只读，缓存是唯一的内部可变状态。
//!
//! # 风险提示（Trade-offs）
//! - 缓存以具体类型为键，这要求 [`Message::contracts`] 对同一类型恒定返回同一切片。

mod arguments;
mod behavior;
mod registration;

use std::{any::TypeId, borrow::Cow, fmt, future::Future, sync::Arc};

use dashmap::DashMap;

use crate::{
    CoreError, Result,
    context::MessageContext,
    message::{Message, MessageIdentity, TypeKey},
};

pub use arguments::{Argument, Arguments};
pub use behavior::{DispatchBehavior, MissingHandlerPolicy};
pub use registration::{HandlerOutput, HandlerRegistration, IntoHandlerOutput, Invoker};

use registration::{boxed, failed};

/// 收集处理器注册并构建只读分发表。
///
/// ```
/// use std::sync::Arc;
/// use courier_core::{dispatch::HandlerTableBuilder, Message};
///
/// #[derive(Debug)]
/// struct Ping;
/// impl Message for Ping {}
///
/// let mut builder = HandlerTableBuilder::new();
/// builder.handle("ping", |_ping: Arc<Ping>| async { Ok(()) });
/// let table = builder.build();
/// assert_eq!(table.len(), 1);
/// ```
#[derive(Default)]
pub struct HandlerTableBuilder {
    registrations: Vec<HandlerRegistration>,
}

impl HandlerTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 原始注册入口。
    ///
    /// # 教案级注释
    /// - **输入参数**
    ///   - `message_type`：声明处理的消息类型或契约；
    ///   - `target`：可选目标类型，从作用域解析后放在第 0 个槽位；
    ///   - `parameters`：按位置排列的参数类型；
    ///   - `invoker`：接收 [`Arguments`] 的调用入口。
    /// - **后置条件**：记录获得递增的注册序号，分发时按序执行。
    pub fn register(
        &mut self,
        label: impl Into<Cow<'static, str>>,
        message_type: TypeKey,
        target: Option<TypeKey>,
        parameters: Vec<TypeKey>,
        invoker: Invoker,
    ) -> &mut Self {
        let ordinal = self.registrations.len();
        self.registrations.push(HandlerRegistration::new(
            label.into(),
            message_type,
            target,
            parameters,
            invoker,
            ordinal,
        ));
        self
    }

    /// 注册只接收消息的处理器。
    pub fn handle<M, F, Fut, O>(
        &mut self,
        label: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> &mut Self
    where
        M: Message,
        F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: IntoHandlerOutput,
    {
        let invoker: Invoker = Arc::new(move |args: Arguments| match args.message::<M>(0) {
            Ok(message) => boxed(handler(message)),
            Err(err) => failed(err),
        });
        let key = TypeKey::of::<M>();
        self.register(label, key, None, vec![key], invoker)
    }

    /// 注册接收消息与一个依赖服务的处理器，服务从作用域解析。
    pub fn handle_with<M, D, F, Fut, O>(
        &mut self,
        label: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> &mut Self
    where
        M: Message,
        D: Send + Sync + 'static,
        F: Fn(Arc<M>, Arc<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: IntoHandlerOutput,
    {
        let invoker: Invoker = Arc::new(move |args: Arguments| {
            match (args.message::<M>(0), args.service::<D>(1)) {
                (Ok(message), Ok(service)) => boxed(handler(message, service)),
                (Err(err), _) | (_, Err(err)) => failed(err),
            }
        });
        let key = TypeKey::of::<M>();
        self.register(label, key, None, vec![key, TypeKey::of::<D>()], invoker)
    }

    /// 注册挂在目标实例上的处理器，目标从作用域解析。
    pub fn handle_on<T, M, F, Fut, O>(
        &mut self,
        label: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> &mut Self
    where
        T: Send + Sync + 'static,
        M: Message,
        F: Fn(Arc<T>, Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: IntoHandlerOutput,
    {
        let invoker: Invoker = Arc::new(move |args: Arguments| {
            match (args.target::<T>(), args.message::<M>(1)) {
                (Ok(target), Ok(message)) => boxed(handler(target, message)),
                (Err(err), _) | (_, Err(err)) => failed(err),
            }
        });
        let key = TypeKey::of::<M>();
        self.register(label, key, Some(TypeKey::of::<T>()), vec![key], invoker)
    }

    /// 注册面向契约的处理器：所有声明了契约 `C` 的消息都会匹配，
    /// 处理器以 `dyn Message` 形式收到消息。
    pub fn handle_contract<C, F, Fut, O>(
        &mut self,
        label: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> &mut Self
    where
        C: ?Sized + 'static,
        F: Fn(Arc<dyn Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: IntoHandlerOutput,
    {
        let invoker: Invoker = Arc::new(move |args: Arguments| match args.message_ref(0) {
            Ok(message) => boxed(handler(Arc::clone(message))),
            Err(err) => failed(err),
        });
        let key = TypeKey::of::<C>();
        self.register(label, key, None, vec![key], invoker)
    }

    /// 注册匹配任意消息的处理器，等价于以 [`ANY_MESSAGE`](crate::ANY_MESSAGE) 为契约。
    pub fn handle_any<F, Fut, O>(
        &mut self,
        label: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Arc<dyn Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: IntoHandlerOutput,
    {
        self.handle_contract::<dyn Message, F, Fut, O>(label, handler)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn build(self) -> HandlerDispatchTable {
        HandlerDispatchTable {
            registrations: self.registrations.into_iter().map(Arc::new).collect(),
            cache: DashMap::new(),
        }
    }
}

type Matches = Arc<[Arc<HandlerRegistration>]>;

/// 只读分发表，附带按运行时类型缓存的匹配结果。
pub struct HandlerDispatchTable {
    registrations: Arc<[Arc<HandlerRegistration>]>,
    cache: DashMap<TypeId, Matches>,
}

impl HandlerDispatchTable {
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn registrations(&self) -> &[Arc<HandlerRegistration>] {
        &self.registrations
    }

    /// 匹配运行时类型的全部注册记录，按注册顺序排列。
    pub fn dispatchers_for(&self, identity: &MessageIdentity) -> Matches {
        let key = identity.concrete().id();
        if let Some(hit) = self.cache.get(&key) {
            return Arc::clone(hit.value());
        }
        let matched: Matches = self
            .registrations
            .iter()
            .filter(|registration| identity.is_assignable_to(registration.message_type()))
            .cloned()
            .collect();
        Arc::clone(&*self.cache.entry(key).or_insert(matched))
    }

    /// 为单个处理器构造实参列表。
    pub fn build_arguments(
        &self,
        registration: &HandlerRegistration,
        ctx: &MessageContext,
    ) -> Result<Arguments> {
        let identity = ctx.envelope().identity();
        let mut slots = Vec::with_capacity(registration.arity());
        if let Some(target) = registration.target() {
            slots.push(Argument::Target(ctx.resolve(target)?));
        }
        for &parameter in registration.parameters() {
            if identity.is_assignable_to(parameter) {
                slots.push(Argument::Message(ctx.envelope().body().clone()));
            } else {
                slots.push(Argument::Service(ctx.resolve(parameter)?));
            }
        }
        Ok(Arguments::new(slots))
    }

    /// 执行单个处理器。
    pub async fn execute(
        &self,
        registration: &HandlerRegistration,
        ctx: &MessageContext,
    ) -> Result<HandlerOutput> {
        let arguments = self.build_arguments(registration, ctx)?;
        registration.invoke(arguments).await
    }

    /// 依次执行匹配当前消息的全部处理器。
    ///
    /// # 执行逻辑（How）
    /// 1. 取出缓存的匹配结果，按注册顺序逐个执行；
    /// 2. 单个处理器失败不影响后续处理器，失败被记录下来；
    /// 3. 全部执行完毕后：无失败返回执行数量；有失败则返回第一个错误，
    ///    多于一个时在描述中附上失败总数，处置分类沿用第一个错误。
    pub async fn dispatch(&self, ctx: &MessageContext) -> Result<usize> {
        let handlers = self.dispatchers_for(ctx.envelope().identity());
        let mut failures: Vec<CoreError> = Vec::new();
        for registration in handlers.iter() {
            if let Err(err) = self.execute(registration, ctx).await {
                tracing::warn!(
                    handler = registration.label(),
                    code = err.code(),
                    error = %err,
                    "message handler failed"
                );
                failures.push(err);
            }
        }

        let total = failures.len();
        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(handlers.len()),
            Some(first) if total == 1 => Err(first),
            Some(first) => {
                let category = first.category();
                Err(CoreError::new(
                    first.code(),
                    format!("{} ({total} handlers failed)", first.message()),
                )
                .with_category(category)
                .with_cause(first))
            }
        }
    }
}

impl fmt::Debug for HandlerDispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDispatchTable")
            .field("registrations", &self.registrations)
            .field("cached_types", &self.cache.len())
            .finish()
    }
}
