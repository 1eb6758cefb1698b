use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::SystemTime,
};

use dashmap::DashMap;
use spin::Mutex;
use tokio::sync::{Notify, futures::Notified};

use courier_core::{
    Envelope, SequenceNumber,
    sequence::AtomicSequence,
    transport::DeliveryFailure,
};

/// 进程内队列注册表。
///
/// # 教案级注释
/// - **意图 (Why)**：同一进程内的发送端与接收端通过地址字符串会合；注册表既可以作为显式值在装配期传递，
///   也可以通过 [`InMemoryNetwork::shared`] 取得进程级实例。
/// - **契约 (What)**：
///   - 队列在首次被发送或接收时创建，之后永不删除；
///   - 克隆只复制内部 `Arc`，所有克隆看到同一组队列；
///   - 消息编号由网络内的原子序号分配，同一网络内唯一。
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    queues: DashMap<String, Arc<MemoryQueue>>,
    message_ids: AtomicSequence,
}

impl InMemoryNetwork {
    /// 创建独立的注册表，与进程级实例互不可见。
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程级共享注册表。
    pub fn shared() -> Self {
        static SHARED: OnceLock<InMemoryNetwork> = OnceLock::new();
        SHARED.get_or_init(InMemoryNetwork::new).clone()
    }

    /// 取得或创建地址对应的队列。
    pub(crate) fn queue(&self, address: &str) -> Arc<MemoryQueue> {
        if let Some(queue) = self.inner.queues.get(address) {
            return Arc::clone(queue.value());
        }
        let queue = self
            .inner
            .queues
            .entry(address.to_owned())
            .or_insert_with(|| Arc::new(MemoryQueue::new(address)));
        Arc::clone(queue.value())
    }

    pub(crate) fn next_message_id(&self) -> SequenceNumber {
        self.inner.message_ids.next()
    }

    /// 队列状态快照，地址从未被使用时返回 `None`。
    pub fn status(&self, address: &str) -> Option<QueueStatus> {
        self.inner
            .queues
            .get(address)
            .map(|queue| queue.value().status())
    }

    /// 打开或关闭队列的入队能力，用于演练“队列不可用”。
    pub fn set_available(&self, address: &str, available: bool) {
        self.queue(address).set_available(available);
    }

    /// 已创建的全部地址，按字典序排列。
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .inner
            .queues
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        addresses.sort();
        addresses
    }

    /// 取走地址上的全部待处理消息，不经过任何接收端。
    pub fn drain(&self, address: &str) -> Vec<Envelope> {
        match self.inner.queues.get(address) {
            Some(queue) => queue.value().drain(),
            None => Vec::new(),
        }
    }
}

impl fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("queues", &self.addresses())
            .finish()
    }
}

/// 单个队列的状态快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    pub address: String,
    /// 尚未出队的消息数。
    pub pending: usize,
    /// 累计出队数。
    pub delivered: u64,
    /// 累计转入毒消息地址的消息数。
    pub poison_count: u64,
    /// 最近一次转入毒消息地址的时间。
    pub last_poison_at: Option<SystemTime>,
    /// 毒消息地址拒绝入队而被丢弃的消息数。
    pub dropped: u64,
    /// 当前是否接受入队。
    pub available: bool,
}

/// 命名的无界 FIFO 加一个电平触发的就绪信号。
pub(crate) struct MemoryQueue {
    address: String,
    messages: Mutex<VecDeque<Envelope>>,
    ready: Notify,
    available: AtomicBool,
    delivered: AtomicU64,
    poison_count: AtomicU64,
    last_poison_at: Mutex<Option<SystemTime>>,
    dropped: AtomicU64,
}

impl MemoryQueue {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
            messages: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            available: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
            poison_count: AtomicU64::new(0),
            last_poison_at: Mutex::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// 追加消息并发出就绪信号。
    pub(crate) fn enqueue(&self, envelope: Envelope) -> Result<(), DeliveryFailure> {
        if !self.available.load(Ordering::Acquire) {
            return Err(DeliveryFailure::QueueUnavailable {
                address: self.address.clone(),
            });
        }
        self.messages.lock().push_back(envelope);
        self.ready.notify_one();
        Ok(())
    }

    /// 取出队首消息。
    ///
    /// 出队后队列仍非空时再发一次信号，让其他竞争消费者也能参与排空。
    pub(crate) fn try_dequeue(&self) -> Option<Envelope> {
        let (envelope, remaining) = {
            let mut messages = self.messages.lock();
            let envelope = messages.pop_front()?;
            (envelope, messages.len())
        };
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if remaining > 0 {
            self.ready.notify_one();
        }
        Some(envelope)
    }

    /// 等待就绪信号；无人等待时发出的信号会被保留给下一次等待。
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.ready.notified()
    }

    pub(crate) fn record_poison(&self) {
        self.poison_count.fetch_add(1, Ordering::Relaxed);
        *self.last_poison_at.lock() = Some(SystemTime::now());
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    fn drain(&self) -> Vec<Envelope> {
        let drained: Vec<Envelope> = self.messages.lock().drain(..).collect();
        self.delivered
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            address: self.address.clone(),
            pending: self.messages.lock().len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            poison_count: self.poison_count.load(Ordering::Relaxed),
            last_poison_at: *self.last_poison_at.lock(),
            dropped: self.dropped.load(Ordering::Relaxed),
            available: self.available.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::Message;
    use std::time::Duration;

    #[derive(Debug)]
    struct Note(u32);

    impl Message for Note {}

    #[test]
    fn queues_are_created_lazily_and_shared() {
        let network = InMemoryNetwork::new();
        assert!(network.status("inbox").is_none());
        let a = network.queue("inbox");
        let b = network.clone().queue("inbox");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(network.addresses(), ["inbox"]);
    }

    #[test]
    fn explicit_networks_are_isolated_from_the_shared_one() {
        let local = InMemoryNetwork::new();
        local.queue("isolated-only");
        assert!(InMemoryNetwork::shared().status("isolated-only").is_none());
    }

    #[test]
    fn unavailable_queue_rejects_enqueue() {
        let network = InMemoryNetwork::new();
        network.set_available("inbox", false);
        let queue = network.queue("inbox");
        let err = queue.enqueue(Envelope::new(Note(1))).err().expect("不可用");
        assert_eq!(err.address(), "inbox");
        network.set_available("inbox", true);
        assert!(queue.enqueue(Envelope::new(Note(2))).is_ok());
    }

    #[test]
    fn dequeue_is_fifo_and_counted() {
        let network = InMemoryNetwork::new();
        let queue = network.queue("inbox");
        for n in 0..3 {
            queue.enqueue(Envelope::new(Note(n))).expect("入队");
        }
        let order: Vec<u32> = std::iter::from_fn(|| queue.try_dequeue())
            .filter_map(|e| e.downcast::<Note>())
            .map(|note| note.0)
            .collect();
        assert_eq!(order, [0, 1, 2]);
        let status = network.status("inbox").expect("已创建");
        assert_eq!((status.pending, status.delivered), (0, 3));
    }

    /// 信号先于等待发出时会被记住，之后的等待立即返回。
    #[tokio::test]
    async fn signal_without_waiter_is_remembered() {
        let network = InMemoryNetwork::new();
        let queue = network.queue("inbox");
        queue.enqueue(Envelope::new(Note(7))).expect("入队");
        tokio::time::timeout(Duration::from_millis(200), queue.notified())
            .await
            .expect("电平触发的信号不会丢失");
    }
}
