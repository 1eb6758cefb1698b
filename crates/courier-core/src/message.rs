//! 消息模型：类型标识、运行时身份、信封与头部。
//!
//! # 设计背景（Why）
//! - 分发表需要“可赋值”匹配：为某个契约注册的处理器必须接收所有声明了该契约的消息。
//!   Rust 没有子类型关系，因此由消息类型通过 [`Message::contracts`] 显式声明它可赋值到的契约。
//! - 运行时身份在构造 [`Envelope`] 时由泛型参数一次性捕获，之后的分发只比较 [`TypeKey`]，
//!   不再触碰反射信息。
//!
//! # 契约说明（What）
//! - 消息交给管线后不可变：信封内以 `Arc` 共享同一份负载；
//! - 契约列表必须是类型级常量：同一具体类型的所有实例返回同一切片，分发表据此缓存匹配结果。

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// 类型标识，可在常量上下文中构造。
///
/// 以函数指针延迟求值 `TypeId` 与类型名，使 `const` 契约切片成为可能。
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: fn() -> TypeId,
    name: fn() -> &'static str,
}

impl TypeKey {
    /// 取得类型 `T` 的标识；`T` 可以是 `dyn Trait` 形式的契约类型。
    pub const fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>,
            name: type_name::<T>,
        }
    }

    /// 底层 `TypeId`。
    pub fn id(&self) -> TypeId {
        (self.id)()
    }

    /// 可读类型名，仅用于日志与错误描述。
    pub fn name(&self) -> &'static str {
        (self.name)()
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 应用层消息。
///
/// # 契约说明（What）
/// - 实现类型须为 `Send + Sync + 'static`，以便在接收端的并发工作路径间共享；
/// - `contracts` 返回该类型额外声明可赋值到的契约（通常是 `TypeKey::of::<dyn SomeTrait>()`），
///   默认没有任何契约；
/// - 所有消息都可赋值到 [`ANY_MESSAGE`]，为“任意消息”注册的处理器匹配一切。
///
/// ```
/// use courier_core::message::{Message, TypeKey};
///
/// trait Heartbeat {}
///
/// #[derive(Debug)]
/// struct Ping;
///
/// impl Heartbeat for Ping {}
///
/// impl Message for Ping {
///     fn contracts(&self) -> &'static [TypeKey] {
///         const CONTRACTS: &[TypeKey] = &[TypeKey::of::<dyn Heartbeat>()];
///         CONTRACTS
///     }
/// }
/// ```
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// 声明该消息可赋值到的契约类型。
    fn contracts(&self) -> &'static [TypeKey] {
        &[]
    }
}

/// 匹配任意消息的契约标识。
pub const ANY_MESSAGE: TypeKey = TypeKey::of::<dyn Message>();

/// 消息的运行时身份：具体类型加上声明的契约。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageIdentity {
    concrete: TypeKey,
    contracts: &'static [TypeKey],
}

impl MessageIdentity {
    fn of<M: Message>(message: &M) -> Self {
        Self {
            concrete: TypeKey::of::<M>(),
            contracts: message.contracts(),
        }
    }

    /// 具体类型。
    pub fn concrete(&self) -> TypeKey {
        self.concrete
    }

    /// 声明的契约。
    pub fn contracts(&self) -> &'static [TypeKey] {
        self.contracts
    }

    /// `declared` 是否可由该运行时类型赋值：精确匹配、声明的契约或 [`ANY_MESSAGE`]。
    pub fn is_assignable_to(&self, declared: TypeKey) -> bool {
        declared == self.concrete || declared == ANY_MESSAGE || self.contracts.contains(&declared)
    }
}

/// 信封内的负载：同一分配的两个视图。
///
/// `message` 供契约处理器以 `dyn Message` 访问，`payload` 供具体类型的下转型。
#[derive(Clone)]
pub struct MessageBody {
    message: Arc<dyn Message>,
    payload: Arc<dyn Any + Send + Sync>,
}

impl MessageBody {
    fn from_arc<M: Message>(message: Arc<M>) -> Self {
        Self {
            payload: message.clone(),
            message,
        }
    }

    /// 以对象形式访问消息。
    pub fn message(&self) -> &Arc<dyn Message> {
        &self.message
    }

    /// 下转型为具体类型，不复制负载。
    pub fn downcast<M: Message>(&self) -> Option<Arc<M>> {
        Arc::clone(&self.payload).downcast::<M>().ok()
    }
}

impl fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.message, f)
    }
}

/// 头部映射：键区分大小写，插入顺序无语义。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// 写入头部并返回旧值。
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// 众所周知的头部键。
pub mod headers {
    /// 发送端分配的消息编号。
    pub const MESSAGE_ID: &str = "courier-message-id";
    /// 消息具体类型名，仅供观测。
    pub const MESSAGE_TYPE: &str = "courier-message-type";
    /// 回复地址。
    pub const RETURN_ADDRESS: &str = "courier-return-address";
    /// 进入毒消息队列时附带的最后一次失败描述。
    pub const ERROR_DETAILS: &str = "courier-error-details";
    /// 进入毒消息队列前累计的投递次数。
    pub const DELIVERY_ATTEMPTS: &str = "courier-delivery-attempts";
    /// 回复消息携带的原消息编号。
    pub const CORRELATION_ID: &str = "courier-correlation-id";
}

/// 消息信封：负载、运行时身份与头部。
///
/// # 契约说明（What）
/// - 克隆信封只复制头部映射与两个 `Arc`，负载本身不被复制；
/// - 发送到多个地址时每个地址得到独立的信封副本，头部修改互不影响。
#[derive(Clone, Debug)]
pub struct Envelope {
    body: MessageBody,
    identity: MessageIdentity,
    headers: Headers,
}

impl Envelope {
    /// 以消息值构造信封，同时捕获其运行时身份。
    pub fn new<M: Message>(message: M) -> Self {
        Self::from_arc(Arc::new(message))
    }

    /// 以共享消息构造信封。
    pub fn from_arc<M: Message>(message: Arc<M>) -> Self {
        let identity = MessageIdentity::of(message.as_ref());
        let mut headers = Headers::new();
        headers.insert(headers::MESSAGE_TYPE, identity.concrete().name());
        Self {
            body: MessageBody::from_arc(message),
            identity,
            headers,
        }
    }

    /// 追加头部，便于链式构造。
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn message(&self) -> &Arc<dyn Message> {
        self.body.message()
    }

    pub fn identity(&self) -> &MessageIdentity {
        &self.identity
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// 下转型为具体消息类型。
    pub fn downcast<M: Message>(&self) -> Option<Arc<M>> {
        self.body.downcast::<M>()
    }

    /// 消息编号，未经发送端盖章时为 `None`。
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID)
    }
}
