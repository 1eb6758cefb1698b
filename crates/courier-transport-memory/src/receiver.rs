use std::{
    any::Any,
    fmt, mem,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures_util::FutureExt;
use spin::Mutex;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    task::JoinHandle,
};

use courier_core::{
    CoreError, Envelope, ErrorCategory, InboundProcessor, Logger, Result, TransportMetadata,
    codes, headers,
    transport::{Receiver, ReceiverOptions, StopReport},
};

use crate::network::{InMemoryNetwork, MemoryQueue};

/// 只出队模式（`max_concurrency = 0`）下接收消息的回调。
pub type ReceiveListener = Arc<dyn Fn(Envelope) + Send + Sync>;

/// 进程内接收端。
///
/// # 教案级注释
/// - **意图 (Why)**：从单一地址持续拉取消息并交给入站处理器，同时保证停止时不丢弃进行中的处理。
/// - **执行逻辑 (How)**：
///   1. 拉取循环先取并发许可，再尝试出队；出到消息就把消息与许可一起交给处理任务；
///   2. 队列为空时归还许可，在就绪信号与停止信号上等待，被唤醒后继续排空；
///   3. 处理任务按 `max_retries + 1` 次尝试执行，不可重试的错误提前结束，耗尽后转入毒消息地址；
///   4. `stop` 发出停止信号、等待循环退出，再在剩余时间内收回全部许可，以此判断是否排空。
/// - **契约 (What)**：
///   - `max_concurrency = 1` 时消息严格按队列顺序处理；
///   - `max_concurrency = 0` 时只出队并交给可选的监听回调，不执行管线；
///   - `stop` 的总等待时长不超过 `timeout`，超时后仍在运行的处理任务不会被中止。
pub struct InMemoryReceiver {
    shared: Arc<ReceiverShared>,
    state: Mutex<ReceiverState>,
}

struct ReceiverShared {
    options: ReceiverOptions,
    poison_address: String,
    queue: Arc<MemoryQueue>,
    network: InMemoryNetwork,
    processor: Arc<dyn InboundProcessor>,
    listener: Option<ReceiveListener>,
    slots: Arc<Semaphore>,
    logger: Logger,
}

enum ReceiverState {
    Idle,
    Running {
        stop: watch::Sender<bool>,
        pump: JoinHandle<()>,
    },
    Stopped,
}

impl InMemoryReceiver {
    pub(crate) fn new(
        network: InMemoryNetwork,
        options: ReceiverOptions,
        processor: Arc<dyn InboundProcessor>,
        listener: Option<ReceiveListener>,
        logger: Logger,
    ) -> Result<Self> {
        options.validate()?;
        if options.max_concurrency > Semaphore::MAX_PERMITS
            || u32::try_from(options.max_concurrency).is_err()
        {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                format!("max_concurrency {} is out of range", options.max_concurrency),
            ));
        }
        let queue = network.queue(&options.address);
        Ok(Self {
            shared: Arc::new(ReceiverShared {
                poison_address: options.resolved_poison_address(),
                slots: Arc::new(Semaphore::new(options.max_concurrency)),
                options,
                queue,
                network,
                processor,
                listener,
                logger,
            }),
            state: Mutex::new(ReceiverState::Idle),
        })
    }

    pub fn options(&self) -> &ReceiverOptions {
        &self.shared.options
    }

    /// 当前正在执行的处理任务数。
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), ReceiverState::Running { .. })
    }
}

impl fmt::Debug for InMemoryReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryReceiver")
            .field("options", &self.shared.options)
            .field("running", &self.is_running())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[async_trait]
impl Receiver for InMemoryReceiver {
    fn address(&self) -> &str {
        &self.shared.options.address
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(*state, ReceiverState::Running { .. }) {
            return Err(CoreError::new(
                codes::TRANSPORT_ALREADY_STARTED,
                format!("receiver for `{}` is already running", self.address()),
            ));
        }
        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let pump = if shared.options.max_concurrency == 0 {
            tokio::spawn(listen(shared, stop_rx))
        } else {
            tokio::spawn(pump(shared, stop_rx))
        };
        *state = ReceiverState::Running { stop, pump };
        tracing::info!(
            parent: self.shared.logger.span(),
            address = %self.shared.options.address,
            max_concurrency = self.shared.options.max_concurrency,
            "receiver started"
        );
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> Result<StopReport> {
        let started = Instant::now();
        let previous = mem::replace(&mut *self.state.lock(), ReceiverState::Stopped);
        let ReceiverState::Running { stop, pump } = previous else {
            return Ok(StopReport {
                drained: true,
                in_flight: 0,
                elapsed: started.elapsed(),
            });
        };

        let _ = stop.send(true);
        match tokio::time::timeout(timeout, pump).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(
                    parent: self.shared.logger.span(),
                    error = %err,
                    "receiver pump terminated abnormally"
                );
            }
            Err(_) => {
                tracing::warn!(
                    parent: self.shared.logger.span(),
                    "receiver pump did not exit before timeout"
                );
            }
        }

        let drained = self
            .shared
            .wait_idle(timeout.saturating_sub(started.elapsed()))
            .await;
        let report = StopReport {
            drained,
            in_flight: self.shared.in_flight(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            parent: self.shared.logger.span(),
            address = %self.shared.options.address,
            drained = report.drained,
            in_flight = report.in_flight,
            "receiver stopped"
        );
        Ok(report)
    }
}

impl ReceiverShared {
    fn in_flight(&self) -> usize {
        self.options
            .max_concurrency
            .saturating_sub(self.slots.available_permits())
    }

    /// 在 `budget` 内收回全部并发许可，成功即表示没有进行中的处理。
    async fn wait_idle(&self, budget: Duration) -> bool {
        let Ok(total) = u32::try_from(self.options.max_concurrency) else {
            return false;
        };
        if total == 0 {
            return true;
        }
        match tokio::time::timeout(budget, self.slots.acquire_many(total)).await {
            Ok(Ok(_all)) => true,
            Ok(Err(_closed)) => true,
            Err(_elapsed) => false,
        }
    }

    async fn process(self: Arc<Self>, envelope: Envelope, _slot: OwnedSemaphorePermit) {
        let attempts = self.options.max_retries.saturating_add(1);
        let reply_to = envelope
            .headers()
            .get(headers::RETURN_ADDRESS)
            .map(str::to_owned);
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            let mut metadata =
                TransportMetadata::new(self.options.address.clone()).with_attempt(attempt);
            metadata.reply_to = reply_to.clone();
            // 处理器 panic 与返回错误走同一条重试与毒消息路径。
            let result = AssertUnwindSafe(self.processor.process(envelope.clone(), metadata))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(processor_panicked(panic.as_ref())));
            let err = match result {
                Ok(outcome) => {
                    tracing::trace!(
                        parent: self.logger.span(),
                        attempt,
                        ?outcome,
                        "message processed"
                    );
                    return;
                }
                Err(err) => err,
            };
            tracing::warn!(
                parent: self.logger.span(),
                address = %self.options.address,
                attempt,
                code = err.code(),
                error = %err,
                "message processing failed"
            );
            match err.category() {
                ErrorCategory::Retryable(delay) if attempt < attempts => {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                }
                _ => break err,
            }
        };
        self.poison(envelope, &failure, attempt);
    }

    /// 把重试耗尽的消息复制到毒消息地址，并更新源队列的计数。
    ///
    /// 毒消息地址拒绝入队时消息被丢弃，计入 `dropped` 而不是 `poison_count`。
    fn poison(&self, mut envelope: Envelope, failure: &CoreError, attempts: u32) {
        envelope
            .headers_mut()
            .insert(headers::ERROR_DETAILS, failure.to_string());
        envelope
            .headers_mut()
            .insert(headers::DELIVERY_ATTEMPTS, attempts.to_string());
        match self.network.queue(&self.poison_address).enqueue(envelope) {
            Ok(()) => {
                self.queue.record_poison();
                tracing::error!(
                    parent: self.logger.span(),
                    address = %self.options.address,
                    poison_address = %self.poison_address,
                    attempts,
                    "message moved to poison queue"
                );
            }
            Err(rejected) => {
                self.queue.record_dropped();
                let err = CoreError::from(rejected);
                tracing::error!(
                    parent: self.logger.span(),
                    address = %self.options.address,
                    poison_address = %self.poison_address,
                    code = err.code(),
                    error = %err,
                    "poison queue rejected message, message dropped"
                );
            }
        }
    }
}

/// 拉取循环。
async fn pump(shared: Arc<ReceiverShared>, mut stop: watch::Receiver<bool>) {
    let queue = Arc::clone(&shared.queue);
    while !*stop.borrow() {
        let slot = tokio::select! {
            biased;
            _ = stop.changed() => break,
            slot = Arc::clone(&shared.slots).acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_closed) => break,
            },
        };

        match queue.try_dequeue() {
            Some(envelope) => {
                tokio::spawn(Arc::clone(&shared).process(envelope, slot));
            }
            None => {
                drop(slot);
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = queue.notified() => {}
                }
            }
        }
    }
    tracing::debug!(
        parent: shared.logger.span(),
        address = %queue.address(),
        "receiver pump exited"
    );
}

/// 只出队循环：消息交给监听回调，不经过入站处理器。
async fn listen(shared: Arc<ReceiverShared>, mut stop: watch::Receiver<bool>) {
    let queue = Arc::clone(&shared.queue);
    while !*stop.borrow() {
        match queue.try_dequeue() {
            Some(envelope) => match &shared.listener {
                Some(listener) => listener(envelope),
                None => tracing::trace!(
                    parent: shared.logger.span(),
                    "message dequeued without listener"
                ),
            },
            None => {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = queue.notified() => {}
                }
            }
        }
    }
    tracing::debug!(
        parent: shared.logger.span(),
        address = %queue.address(),
        "receiver listener exited"
    );
}

/// 把处理器的 panic 转为处理器失败，保留 panic 文本。
fn processor_panicked(panic: &(dyn Any + Send)) -> CoreError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    CoreError::handler_failure(format!("inbound processor panicked: {detail}"))
}
