//! 按组件命名的日志句柄。
//!
//! # 教案级注释
//! - **设计动机 (Why)**
//!   - 接收端、Acceptor、分发表等组件都需要带组件名的结构化日志，
//!     但日志注册表必须是装配期显式传入的值，而非进程级全局变量，
//!     这样同一进程内的多条总线互不干扰，测试也能各自持有独立的注册表。
//! - **实现策略 (How)**
//!   - [`Logger`] 持有一个带 `component` 字段的 `tracing::Span`，组件以
//!     `tracing::warn!(parent: logger.span(), ..)` 记录事件；
//!   - [`LoggerRegistry`] 以 `DashMap` 缓存同名句柄，克隆注册表只复制 `Arc`。
//! - **风险提示 (Trade-offs)**
//!   - Span 在首次取用时创建；若此时尚未安装订阅者，该 Span 不会被记录，
//!     事件本身仍会正常输出。宿主应先安装订阅者再装配组件。

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use tracing::Span;

/// 单个组件的日志句柄。
#[derive(Clone)]
pub struct Logger {
    component: Arc<str>,
    span: Span,
}

impl Logger {
    /// 构造独立句柄，不经过注册表。
    pub fn new(component: impl Into<Arc<str>>) -> Self {
        let component = component.into();
        let span = tracing::info_span!("courier", component = %component);
        Self { component, span }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// 事件的父 Span。
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("component", &self.component)
            .finish()
    }
}

/// 显式传递的日志句柄注册表。
#[derive(Clone, Default)]
pub struct LoggerRegistry {
    loggers: Arc<DashMap<Arc<str>, Logger>>,
}

impl LoggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得组件句柄，同名组件共享同一个 Span。
    pub fn logger(&self, component: &str) -> Logger {
        if let Some(existing) = self.loggers.get(component) {
            return existing.clone();
        }
        self.loggers
            .entry(Arc::from(component))
            .or_insert_with(|| Logger::new(component))
            .clone()
    }

    /// 组件是否已经取用过句柄。
    pub fn contains(&self, component: &str) -> bool {
        self.loggers.contains_key(component)
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl fmt::Debug for LoggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self
            .loggers
            .iter()
            .map(|entry| entry.key().to_string())
            .collect();
        names.sort();
        f.debug_struct("LoggerRegistry")
            .field("components", &names)
            .finish()
    }
}
