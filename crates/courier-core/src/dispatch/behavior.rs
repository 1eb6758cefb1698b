use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    CoreError, ErrorCategory, Result,
    context::MessageContext,
    dispatch::HandlerDispatchTable,
    error::codes,
    logging::Logger,
    pipeline::{Behavior, BehaviorDescriptor, ChainOutcome, Next},
};

/// 没有任何处理器匹配时的处置方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingHandlerPolicy {
    /// 返回 `dispatch.no_handler`，交由接收端重试或转入毒消息路径。
    #[default]
    Fail,
    /// 记录日志后视为处理成功。
    Ignore,
}

/// 管线最内层的 Behavior：把消息交给分发表。
///
/// # 教案级注释
/// - **契约 (What)**
///   - 按注册顺序执行全部匹配的处理器，单个失败不阻断其余处理器，最终汇总为一个错误；
///   - 没有匹配时按 [`MissingHandlerPolicy`] 处置；
///   - 处理完成后仍调用续调，位于它之后的 Behavior 照常执行。
pub struct DispatchBehavior {
    table: Arc<HandlerDispatchTable>,
    policy: MissingHandlerPolicy,
    logger: Logger,
}

impl DispatchBehavior {
    pub const NAME: &'static str = "dispatch";

    pub fn new(table: Arc<HandlerDispatchTable>, logger: Logger) -> Self {
        Self {
            table,
            policy: MissingHandlerPolicy::default(),
            logger,
        }
    }

    pub fn with_policy(mut self, policy: MissingHandlerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn table(&self) -> &Arc<HandlerDispatchTable> {
        &self.table
    }
}

#[async_trait]
impl Behavior for DispatchBehavior {
    fn descriptor(&self) -> BehaviorDescriptor {
        BehaviorDescriptor::new(
            Self::NAME,
            "dispatch",
            "invoke every handler whose declared type accepts the message",
        )
    }

    async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<ChainOutcome> {
        let handled = self.table.dispatch(ctx).await?;
        if handled == 0 {
            let message_type = ctx.envelope().identity().concrete().name();
            match self.policy {
                MissingHandlerPolicy::Fail => {
                    tracing::warn!(
                        parent: self.logger.span(),
                        message_type,
                        "no handler registered"
                    );
                    return Err(CoreError::new(
                        codes::DISPATCH_NO_HANDLER,
                        format!("no handler registered for `{message_type}`"),
                    )
                    .with_category(ErrorCategory::NonRetryable));
                }
                MissingHandlerPolicy::Ignore => {
                    tracing::debug!(parent: self.logger.span(), message_type, "message ignored");
                }
            }
        }
        next.run(ctx).await
    }
}
