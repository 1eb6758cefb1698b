//! 中间件管线：把有序的 Behavior 列表组合为单条调用链。
//!
//! # 设计背景（Why）
//! - 入站消息在到达处理器之前需要经过一组横切逻辑（审计、去重、事务、异常翻译等），
//!   每个 Behavior 只关心“我之前/之后做什么”，由引擎负责把它们串起来。
//! - 链路在装配期编译一次，运行期只遍历切片，不再分配中间闭包。
//!
//! # 契约说明（What）
//! - 组合方向自右向左：`[b0, b1, .., bn]` 执行 `b0.invoke(ctx, next = [b1..bn])`；
//! - 空列表编译为立即成功的空操作；
//! - [`Next`] 按值消费，因此每个 Behavior 至多调用一次续调；
//! - 不调用续调的 Behavior 必须返回 [`ChainOutcome::ShortCircuited`]；
//! - 任一 Behavior 返回错误即中止剩余链路，错误原样上抛给接收端。
//!
//! # 风险提示（Trade-offs）
//! - 诊断模式会为每一层分配一个计数器并在返回后校验，适合测试与预发环境；
//!   生产环境关闭后引擎只做切片遍历。

use std::{
    borrow::Cow,
    collections::HashSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::Instrument;

use crate::{
    CoreError, Result,
    context::{MessageContext, TransportMetadata},
    error::codes,
    message::Envelope,
    resolve::{ResolutionScope, ServiceResolver},
};

/// 单个 Behavior 的执行结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainOutcome {
    /// 链路完整执行到末端。
    Completed,
    /// 某个 Behavior 有意截断了链路，后续环节未执行。
    ShortCircuited,
}

impl ChainOutcome {
    pub fn is_completed(self) -> bool {
        matches!(self, ChainOutcome::Completed)
    }
}

/// Behavior 的自描述信息，用于日志与拓扑展示。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BehaviorDescriptor {
    name: Cow<'static, str>,
    category: Cow<'static, str>,
    summary: Cow<'static, str>,
}

impl BehaviorDescriptor {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        category: impl Into<Cow<'static, str>>,
        summary: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            summary: summary.into(),
        }
    }

    /// 只有名称的描述，类别记为 `custom`。
    pub fn anonymous(name: impl Into<Cow<'static, str>>) -> Self {
        Self::new(name, "custom", "")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }
}

/// 管线中的一个中间件单元。
///
/// # 教案级注释
/// - **契约 (What)**
///   - `invoke` 收到独占的上下文与续调 `next`；调用 `next.run(ctx)` 进入下一环；
///   - 不调用 `next` 时必须返回 [`ChainOutcome::ShortCircuited`]，否则诊断模式判定为违例；
///   - 内层返回的 `ShortCircuited` 可以原样向外传播。
/// - **前置条件**：实现需 `Send + Sync`，同一实例会被多个并发消息共享。
///
/// ```
/// use courier_core::{
///     async_trait,
///     pipeline::{Behavior, BehaviorDescriptor, ChainOutcome, Next},
///     MessageContext, Result,
/// };
///
/// struct Stamp;
///
/// #[async_trait]
/// impl Behavior for Stamp {
///     fn descriptor(&self) -> BehaviorDescriptor {
///         BehaviorDescriptor::anonymous("stamp")
///     }
///
///     async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<ChainOutcome> {
///         ctx.headers_mut().insert("stamped", "yes");
///         next.run(ctx).await
///     }
/// }
/// ```
#[async_trait]
pub trait Behavior: Send + Sync + 'static {
    /// 描述信息，名称在同一条管线内必须唯一。
    fn descriptor(&self) -> BehaviorDescriptor;

    /// 执行本环逻辑。
    async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<ChainOutcome>;
}

/// 指向剩余链路的续调。
///
/// 按值消费，调用一次即失效。
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Behavior>],
    next_calls: Option<&'a AtomicU32>,
    diagnostics: bool,
}

impl<'a> Next<'a> {
    /// 执行剩余链路。
    pub async fn run(self, ctx: &mut MessageContext) -> Result<ChainOutcome> {
        if let Some(next_calls) = self.next_calls {
            next_calls.fetch_add(1, Ordering::Relaxed);
        }
        run_chain(self.remaining, self.diagnostics, ctx).await
    }

    /// 剩余环节数量，`0` 表示已到链路末端。
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.remaining.len())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

fn run_chain<'a>(
    behaviors: &'a [Arc<dyn Behavior>],
    diagnostics: bool,
    ctx: &'a mut MessageContext,
) -> BoxFuture<'a, Result<ChainOutcome>> {
    Box::pin(async move {
        let Some((head, tail)) = behaviors.split_first() else {
            return Ok(ChainOutcome::Completed);
        };

        if !diagnostics {
            let next = Next {
                remaining: tail,
                next_calls: None,
                diagnostics,
            };
            return head.invoke(ctx, next).await;
        }

        let calls = AtomicU32::new(0);
        let next = Next {
            remaining: tail,
            next_calls: Some(&calls),
            diagnostics,
        };
        let outcome = head.invoke(ctx, next).await?;
        check_continuation(head.as_ref(), calls.load(Ordering::Relaxed), outcome)?;
        Ok(outcome)
    })
}

fn check_continuation(behavior: &dyn Behavior, calls: u32, outcome: ChainOutcome) -> Result<()> {
    let violation = match (calls, outcome) {
        (0, ChainOutcome::Completed) => "returned Completed without invoking next",
        (0, ChainOutcome::ShortCircuited) | (1, _) => return Ok(()),
        _ => "invoked next more than once",
    };
    let descriptor = behavior.descriptor();
    tracing::error!(
        behavior = descriptor.name(),
        calls,
        ?outcome,
        "pipeline chain violation"
    );
    Err(CoreError::chain_violation(format!(
        "behavior `{}` {violation} (calls = {calls})",
        descriptor.name()
    )))
}

/// 编译选项。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// 是否校验续调契约。
    pub diagnostics: bool,
}

/// 编译完成、运行期只读的管线。
#[derive(Clone)]
pub struct CompiledPipeline {
    behaviors: Arc<[Arc<dyn Behavior>]>,
    options: PipelineOptions,
}

impl CompiledPipeline {
    /// 编译 Behavior 列表，顺序即执行顺序。
    pub fn compile(behaviors: Vec<Arc<dyn Behavior>>, options: PipelineOptions) -> Self {
        Self {
            behaviors: behaviors.into(),
            options,
        }
    }

    /// 空管线，调用立即返回 [`ChainOutcome::Completed`]。
    pub fn empty() -> Self {
        Self::compile(Vec::new(), PipelineOptions::default())
    }

    /// 对一条消息执行整条链路。
    pub async fn invoke(&self, ctx: &mut MessageContext) -> Result<ChainOutcome> {
        run_chain(&self.behaviors, self.options.diagnostics, ctx).await
    }

    pub fn descriptors(&self) -> Vec<BehaviorDescriptor> {
        self.behaviors.iter().map(|b| b.descriptor()).collect()
    }

    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }
}

impl fmt::Debug for CompiledPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .behaviors
            .iter()
            .map(|b| b.descriptor().name().to_owned())
            .collect();
        f.debug_struct("CompiledPipeline")
            .field("behaviors", &names)
            .field("options", &self.options)
            .finish()
    }
}

/// 管线装配错误。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("behavior `{name}` already registered")]
    DuplicateBehavior { name: String },
}

impl From<PipelineError> for CoreError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        CoreError::new(codes::PIPELINE_DUPLICATE_BEHAVIOR, message).with_cause(err)
    }
}

/// 按注册顺序收集 Behavior 并编译管线。
///
/// # 教案级注释
/// - **契约 (What)**
///   - 名称必须唯一，重复注册返回 [`PipelineError::DuplicateBehavior`]；
///   - 注册顺序即执行顺序，`build` 之后顺序在总线生命周期内不再变化。
#[derive(Default)]
pub struct PipelineBuilder {
    behaviors: Vec<Arc<dyn Behavior>>,
    names: HashSet<String>,
    options: PipelineOptions,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个 Behavior。
    pub fn register(&mut self, behavior: Arc<dyn Behavior>) -> Result<&mut Self, PipelineError> {
        let name = behavior.descriptor().name().to_owned();
        if !self.names.insert(name.clone()) {
            return Err(PipelineError::DuplicateBehavior { name });
        }
        self.behaviors.push(behavior);
        Ok(self)
    }

    /// 打开或关闭续调契约校验。
    pub fn diagnostics(&mut self, enabled: bool) -> &mut Self {
        self.options.diagnostics = enabled;
        self
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    pub fn build(self) -> CompiledPipeline {
        CompiledPipeline::compile(self.behaviors, self.options)
    }
}

/// 接收端交付入站消息的入口。
///
/// 传输实现只依赖这一契约，不感知管线与分发表。
#[async_trait]
pub trait InboundProcessor: Send + Sync + 'static {
    /// 处理一条消息；返回错误时由接收端决定重试或转入毒消息路径。
    async fn process(
        &self,
        envelope: Envelope,
        transport: TransportMetadata,
    ) -> Result<ChainOutcome>;
}

/// 以编译后的管线处理入站消息。
///
/// 每条消息创建新的解析作用域，链路回卷后连同上下文一起释放。
/// 需要在作用域中叠加额外服务的宿主可以自建作用域后调用 [`run_in_scope`](Self::run_in_scope)。
#[derive(Clone)]
pub struct PipelineInbound {
    pipeline: CompiledPipeline,
    resolver: Arc<dyn ServiceResolver>,
}

impl PipelineInbound {
    pub fn new(pipeline: CompiledPipeline, resolver: Arc<dyn ServiceResolver>) -> Self {
        Self { pipeline, resolver }
    }

    pub fn pipeline(&self) -> &CompiledPipeline {
        &self.pipeline
    }

    pub fn resolver(&self) -> &Arc<dyn ServiceResolver> {
        &self.resolver
    }

    /// 在调用方给出的作用域内执行管线。
    pub async fn run_in_scope(
        &self,
        envelope: Envelope,
        scope: Box<dyn ResolutionScope>,
        transport: TransportMetadata,
    ) -> Result<ChainOutcome> {
        let span = tracing::debug_span!(
            "pipeline",
            message_type = envelope.identity().concrete().name(),
            message_id = envelope.message_id().unwrap_or(""),
            address = %transport.source_address,
            attempt = transport.delivery_attempt,
        );
        let mut ctx = MessageContext::new(envelope, scope, transport);
        let outcome = self.pipeline.invoke(&mut ctx).instrument(span).await;
        drop(ctx);
        outcome
    }
}

#[async_trait]
impl InboundProcessor for PipelineInbound {
    async fn process(
        &self,
        envelope: Envelope,
        transport: TransportMetadata,
    ) -> Result<ChainOutcome> {
        let scope = self.resolver.create_scope();
        self.run_in_scope(envelope, scope, transport).await
    }
}
