use std::{
    fmt, mem,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use bytes::BytesMut;
use spin::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use courier_core::{CoreError, ErrorCategory, Result, codes};

/// `BlockPool` 管理固定数量、固定大小的字节块。
///
/// # 模块角色（Why）
/// - 连接的收发缓冲来自同一个池，连接数上限直接换算成内存上限；
/// - 块在池的整个生命周期内只分配一次，租借与归还不触发任何堆分配或拷贝。
///
/// # 核心机制（How）
/// - 构造时预分配 `capacity` 个长度为 `block_size` 的 `BytesMut` 并放入自由链表；
/// - 租借先取信号量许可，再从自由链表弹出一块；归还时先把块推回链表，再释放许可；
/// - `lease_pair` 一次性取得两个许可，避免两个连接各拿到一块后互相等待。
///
/// # 契约说明（What）
/// - **容量**：同时在外的租约数永远不超过 `capacity`；
/// - **归还**：每个租约恰好归还一次，由 [`BlockLease`] 的 `Drop` 完成；
/// - **内容**：租到的块长度恒为 `block_size`，内容是上一位租用者留下的数据，调用方需自行覆盖。
///
/// # 设计权衡（Trade-offs）
/// - 自由链表用自旋锁保护，临界区只有一次 `push`/`pop`；
/// - `close` 之后排队中的租借立即失败，已借出的块仍可正常归还。
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    /// 为 `max_connections` 个连接创建缓冲池，每个连接一块发送缓冲、一块接收缓冲。
    pub fn new(block_size: usize, max_connections: usize) -> Result<Self> {
        let capacity = max_connections.checked_mul(2).ok_or_else(|| {
            CoreError::new(codes::CONFIG_INVALID, "max_connections overflows pool capacity")
        })?;
        Self::with_capacity(block_size, capacity)
    }

    /// 以块数直接指定容量。
    pub fn with_capacity(block_size: usize, capacity: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                "buffer block size must be greater than zero",
            ));
        }
        if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                format!("buffer pool capacity {capacity} is out of range"),
            ));
        }
        let blocks = (0..capacity)
            .map(|slot| Block {
                slot,
                bytes: BytesMut::zeroed(block_size),
            })
            .collect();
        tracing::debug!(block_size, capacity, "buffer pool allocated");
        Ok(Self {
            inner: Arc::new(PoolInner {
                block_size,
                capacity,
                free_list: Mutex::new(blocks),
                permits: Arc::new(Semaphore::new(capacity)),
                metrics: PoolMetrics::default(),
            }),
        })
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// 租借一块缓冲，池已满时等待其他租约归还。
    pub async fn lease(&self) -> Result<BlockLease> {
        let permit = {
            let _waiting = WaitGuard::enter(&self.inner.metrics.waiting);
            Arc::clone(&self.inner.permits)
                .acquire_owned()
                .await
                .map_err(|_| pool_closed())?
        };
        self.inner.checkout(permit)
    }

    /// 立即租借一块缓冲，池已满时返回 `buffer.pool_exhausted`。
    pub fn try_lease(&self) -> Result<BlockLease> {
        let permit = Arc::clone(&self.inner.permits)
            .try_acquire_owned()
            .map_err(|err| self.inner.acquire_failed(err))?;
        self.inner.checkout(permit)
    }

    /// 原子地租借两块缓冲，供一个连接的发送与接收使用。
    pub async fn lease_pair(&self) -> Result<(BlockLease, BlockLease)> {
        let permits = {
            let _waiting = WaitGuard::enter(&self.inner.metrics.waiting);
            Arc::clone(&self.inner.permits)
                .acquire_many_owned(2)
                .await
                .map_err(|_| pool_closed())?
        };
        self.inner.checkout_pair(permits)
    }

    /// 立即租借两块缓冲，不足两块时失败且不占用任何块。
    pub fn try_lease_pair(&self) -> Result<(BlockLease, BlockLease)> {
        let permits = Arc::clone(&self.inner.permits)
            .try_acquire_many_owned(2)
            .map_err(|err| self.inner.acquire_failed(err))?;
        self.inner.checkout_pair(permits)
    }

    /// 关闭池：排队中的与后续的租借全部失败，已借出的租约仍会归还。
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// 读取统计快照。
    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("block_size", &self.inner.block_size)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.inner.permits.available_permits())
            .finish()
    }
}

struct Block {
    slot: usize,
    bytes: BytesMut,
}

struct PoolInner {
    block_size: usize,
    capacity: usize,
    free_list: Mutex<Vec<Block>>,
    permits: Arc<Semaphore>,
    metrics: PoolMetrics,
}

impl PoolInner {
    /// 用已取得的许可换出一块缓冲。
    fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Result<BlockLease> {
        let block = self.free_list.lock().pop().ok_or_else(|| {
            CoreError::new(
                codes::BUFFER_POOL_EXHAUSTED,
                "free list is empty while a permit is held",
            )
        })?;
        self.metrics.active.fetch_add(1, Ordering::Relaxed);
        self.metrics.total_leases.fetch_add(1, Ordering::Relaxed);
        Ok(BlockLease {
            pool: Arc::clone(self),
            block,
            _permit: permit,
        })
    }

    fn checkout_pair(
        self: &Arc<Self>,
        mut permits: OwnedSemaphorePermit,
    ) -> Result<(BlockLease, BlockLease)> {
        let second = permits.split(1).ok_or_else(|| {
            CoreError::new(codes::BUFFER_POOL_EXHAUSTED, "pair lease holds fewer than two permits")
        })?;
        let first = self.checkout(permits)?;
        let second = self.checkout(second)?;
        Ok((first, second))
    }

    fn acquire_failed(&self, err: TryAcquireError) -> CoreError {
        match err {
            TryAcquireError::Closed => pool_closed(),
            TryAcquireError::NoPermits => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                CoreError::new(
                    codes::BUFFER_POOL_EXHAUSTED,
                    format!("all {} buffer blocks are leased", self.capacity),
                )
            }
        }
    }

    fn give_back(&self, block: Block) {
        self.free_list.lock().push(block);
        let _ = self
            .metrics
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(prev.saturating_sub(1))
            });
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            block_size: self.block_size,
            capacity: self.capacity,
            active_leases: self.metrics.active.load(Ordering::Relaxed),
            available_blocks: self.free_list.lock().len(),
            pending_lease_requests: self.metrics.waiting.load(Ordering::Relaxed),
            failed_acquisitions: self.metrics.failed.load(Ordering::Relaxed),
            total_leases: self.metrics.total_leases.load(Ordering::Relaxed),
        }
    }
}

fn pool_closed() -> CoreError {
    CoreError::new(codes::BUFFER_POOL_CLOSED, "buffer pool is closed")
        .with_category(ErrorCategory::Cancelled)
}

#[derive(Default)]
struct PoolMetrics {
    active: AtomicUsize,
    waiting: AtomicUsize,
    failed: AtomicU64,
    total_leases: AtomicU64,
}

/// 等待计数的作用域守卫，租借 future 被取消时同样会减回。
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// 缓冲池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub capacity: usize,
    /// 当前在外的租约数。
    pub active_leases: usize,
    /// 自由链表中的块数。
    pub available_blocks: usize,
    /// 正在等待容量的异步租借数。
    pub pending_lease_requests: usize,
    /// `try_lease` 因容量不足失败的累计次数。
    pub failed_acquisitions: u64,
    /// 累计成功租借次数。
    pub total_leases: u64,
}

/// 一块已租出的缓冲。
///
/// 解引用为长度恒为 `block_size` 的字节切片；`Drop` 时先把块放回自由链表，再释放信号量许可，
/// 被唤醒的等待者因此一定能取到块。
pub struct BlockLease {
    pool: Arc<PoolInner>,
    block: Block,
    _permit: OwnedSemaphorePermit,
}

impl BlockLease {
    /// 块在池中的槽位编号，用于观测块是否被复用。
    pub fn slot(&self) -> usize {
        self.block.slot
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.block.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.block.bytes
    }
}

impl Deref for BlockLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for BlockLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl fmt::Debug for BlockLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockLease")
            .field("slot", &self.block.slot)
            .field("len", &self.block.bytes.len())
            .finish()
    }
}

impl Drop for BlockLease {
    fn drop(&mut self) {
        // 字段 `_permit` 在本函数返回后才析构，块必须在此之前回到链表。
        let block = Block {
            slot: self.block.slot,
            bytes: mem::take(&mut self.block.bytes),
        };
        self.pool.give_back(block);
    }
}
