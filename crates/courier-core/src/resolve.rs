//! 服务解析作用域。
//!
//! # 教案级注释
//! - **设计动机 (Why)**
//!   - 处理器的非消息参数（时钟、仓储、回复通道等）由宿主提供，分发表只关心“按类型取实例”；
//!     具体的依赖注入容器属于外部协作方，这里只定义边界契约。
//!   - 每条入站消息拥有独立的作用域，作用域随 [`MessageContext`](crate::MessageContext)
//!     一起在链路回卷后释放，作用域内创建的实例也随之析构。
//! - **契约 (What)**
//!   - [`ServiceResolver::create_scope`] 为每次分发创建新作用域；
//!   - [`ResolutionScope::resolve`] 按 [`TypeKey`] 返回实例，缺失时返回
//!     `dispatch.resolution_failed` 并携带类型名；
//!   - [`ServiceMap`] 是核心自带的最小实现：单例跨作用域共享，作用域服务在单个作用域内缓存。

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use spin::Mutex;

use crate::{CoreError, Result, message::TypeKey};

/// 解析出的服务实例，调用方按具体类型下转型。
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// 单次分发可见的服务作用域。
pub trait ResolutionScope: Send + Sync {
    /// 解析 `key` 对应的服务。
    fn resolve(&self, key: TypeKey) -> Result<ServiceInstance>;
}

impl dyn ResolutionScope + '_ {
    /// 以具体类型解析服务。
    pub fn resolve_typed<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        let key = TypeKey::of::<T>();
        self.resolve(key)?
            .downcast::<T>()
            .map_err(|_| CoreError::resolution_failure(key.name()))
    }
}

/// 作用域工厂，由宿主在装配阶段提供。
pub trait ServiceResolver: Send + Sync {
    /// 创建新的解析作用域；作用域析构即视为释放。
    fn create_scope(&self) -> Box<dyn ResolutionScope>;
}

/// 不提供任何服务的作用域，未配置解析器的宿主使用它。
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyResolver;

impl ServiceResolver for EmptyResolver {
    fn create_scope(&self) -> Box<dyn ResolutionScope> {
        Box::new(EmptyResolver)
    }
}

impl ResolutionScope for EmptyResolver {
    fn resolve(&self, key: TypeKey) -> Result<ServiceInstance> {
        Err(CoreError::resolution_failure(key.name()))
    }
}

type ScopedFactory = Arc<dyn Fn() -> ServiceInstance + Send + Sync>;

#[derive(Clone, Default)]
struct Registry {
    singletons: HashMap<TypeId, ServiceInstance>,
    scoped: HashMap<TypeId, ScopedFactory>,
}

/// 以类型为键的轻量服务表。
///
/// ```
/// use courier_core::resolve::{ServiceMap, ServiceResolver};
///
/// struct Clock(u64);
///
/// let services = ServiceMap::new().with_singleton(Clock(7));
/// let scope = services.create_scope();
/// let clock = scope.resolve_typed::<Clock>().expect("已注册");
/// assert_eq!(clock.0, 7);
/// ```
#[derive(Clone, Default)]
pub struct ServiceMap {
    registry: Arc<Registry>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册单例，所有作用域共享同一实例。
    pub fn with_singleton<T: Any + Send + Sync>(self, value: T) -> Self {
        self.with_singleton_arc(Arc::new(value))
    }

    /// 注册已共享的单例。
    pub fn with_singleton_arc<T: Any + Send + Sync>(mut self, value: Arc<T>) -> Self {
        Arc::make_mut(&mut self.registry)
            .singletons
            .insert(TypeId::of::<T>(), value);
        self
    }

    /// 注册作用域服务：每个作用域首次解析时调用 `factory`，之后在该作用域内复用。
    pub fn with_scoped<T, F>(mut self, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory: ScopedFactory = Arc::new(move || Arc::new(factory()) as ServiceInstance);
        Arc::make_mut(&mut self.registry)
            .scoped
            .insert(TypeId::of::<T>(), factory);
        self
    }

    /// 已注册的服务数量。
    pub fn len(&self) -> usize {
        self.registry.singletons.len() + self.registry.scoped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ServiceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceMap")
            .field("singletons", &self.registry.singletons.len())
            .field("scoped", &self.registry.scoped.len())
            .finish()
    }
}

impl ServiceResolver for ServiceMap {
    fn create_scope(&self) -> Box<dyn ResolutionScope> {
        Box::new(ServiceMapScope {
            registry: Arc::clone(&self.registry),
            instances: Mutex::new(HashMap::new()),
        })
    }
}

struct ServiceMapScope {
    registry: Arc<Registry>,
    instances: Mutex<HashMap<TypeId, ServiceInstance>>,
}

impl ResolutionScope for ServiceMapScope {
    fn resolve(&self, key: TypeKey) -> Result<ServiceInstance> {
        let id = key.id();
        if let Some(instance) = self.registry.singletons.get(&id) {
            return Ok(Arc::clone(instance));
        }
        let factory = self
            .registry
            .scoped
            .get(&id)
            .ok_or_else(|| CoreError::resolution_failure(key.name()))?;
        if let Some(instance) = self.instances.lock().get(&id) {
            return Ok(Arc::clone(instance));
        }
        // 工厂在锁外执行；并发解析时以先写入者为准。
        let created = factory();
        let mut instances = self.instances.lock();
        Ok(Arc::clone(instances.entry(id).or_insert(created)))
    }
}

impl Drop for ServiceMapScope {
    fn drop(&mut self) {
        let released = self.instances.get_mut().len();
        if released > 0 {
            tracing::trace!(released, "resolution scope disposed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Clock;

    struct UnitOfWork {
        disposed: Arc<AtomicUsize>,
    }

    impl Drop for UnitOfWork {
        fn drop(&mut self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn singletons_are_shared_across_scopes() {
        let services = ServiceMap::new().with_singleton(Clock);
        let first = services.create_scope().resolve_typed::<Clock>().expect("单例");
        let second = services.create_scope().resolve_typed::<Clock>().expect("单例");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn scoped_services_live_and_die_with_their_scope() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disposed);
        let services = ServiceMap::new().with_scoped(move || UnitOfWork {
            disposed: Arc::clone(&counter),
        });

        let scope = services.create_scope();
        let a = scope.resolve_typed::<UnitOfWork>().expect("作用域服务");
        let b = scope.resolve_typed::<UnitOfWork>().expect("作用域服务");
        assert!(Arc::ptr_eq(&a, &b));

        let other = services.create_scope();
        let c = other.resolve_typed::<UnitOfWork>().expect("作用域服务");
        assert!(!Arc::ptr_eq(&a, &c));

        drop((a, b));
        drop(scope);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        drop((c, other));
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_service_names_the_type() {
        let scope = ServiceMap::new().create_scope();
        let err = scope
            .resolve_typed::<Clock>()
            .err()
            .expect("未注册的服务必须失败");
        assert_eq!(err.code(), crate::codes::DISPATCH_RESOLUTION_FAILED);
        assert!(err.message().contains("Clock"));
    }
}
