use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use spin::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{OwnedSemaphorePermit, Semaphore, watch},
};

use courier_buffer::BlockPool;
use courier_core::{
    CoreError, ErrorCategory, Logger, Result, SequenceNumber, sequence::AtomicSequence,
};

use crate::{
    DEFAULT_BROKER_PORT,
    connection::Connection,
    error::{self, AcceptorError, map_io_error},
    reader::ProtocolReader,
};

/// 连接数达到上限时的处置方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// 不再调用 `accept`，多余的连接停留在内核的监听队列中。
    #[default]
    Queue,
    /// 照常接受，随即关闭超出上限的连接。
    Reject,
}

/// 接入器选项。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptorOptions {
    pub listen_addr: SocketAddr,
    /// 同时服务的连接上限，缓冲池容量为其两倍。
    pub max_connections: usize,
    pub buffer_block_size: usize,
    pub overflow: OverflowPolicy,
    /// 传给 `listen(2)` 的监听队列长度。
    pub backlog: i32,
    /// `accept` 失败后的最小退避时长。
    pub accept_backoff: Duration,
}

impl AcceptorOptions {
    pub const DEFAULT_MAX_CONNECTIONS: usize = 128;
    pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            buffer_block_size: Self::DEFAULT_BLOCK_SIZE,
            overflow: OverflowPolicy::default(),
            backlog: 1024,
            accept_backoff: Duration::from_millis(10),
        }
    }

    /// 在所有 IPv4 地址的给定端口上监听。
    pub fn on_port(port: u16) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_buffer_block_size(mut self, buffer_block_size: usize) -> Self {
        self.buffer_block_size = buffer_block_size;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_accept_backoff(mut self, accept_backoff: Duration) -> Self {
        self.accept_backoff = accept_backoff;
        self
    }

    pub fn validate(&self) -> Result<(), AcceptorError> {
        if self.max_connections == 0 {
            return Err(AcceptorError::ZeroConnections);
        }
        if self.max_connections > Semaphore::MAX_PERMITS
            || u32::try_from(self.max_connections).is_err()
        {
            return Err(AcceptorError::TooManyConnections(self.max_connections));
        }
        if self.buffer_block_size == 0 {
            return Err(AcceptorError::ZeroBlockSize);
        }
        Ok(())
    }
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self::on_port(DEFAULT_BROKER_PORT)
    }
}

/// 接入循环所处的阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptorState {
    Idle,
    /// 正在等待连接许可或新连接。
    Accepting,
    /// 刚接受一条连接，正在租借缓冲并移交给读取器。
    Established,
    /// 最近一次 `accept` 失败，正在退避。
    AcceptFailed,
    Stopped,
}

/// 接入器统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcceptorStats {
    /// 成功移交给读取器的连接数。
    pub accepted: u64,
    /// 因超出上限被关闭的连接数。
    pub rejected: u64,
    /// `accept`、套接字配置或缓冲租借失败的次数。
    pub failed: u64,
    /// 当前仍由读取器持有的连接数。
    pub active: usize,
}

/// Broker 的 TCP 连接接入器。
///
/// # 教案级注释
///
/// ## 意图 (Why)
/// - 连接上限与缓冲池容量绑定：每条连接恰好占用两块缓冲，`max_connections` 个许可保证池永不耗尽；
/// - 接入循环只负责“接受 → 配置 → 租借 → 移交”，协议解析全部交给 [`ProtocolReader`]。
///
/// ## 执行逻辑 (How)
/// 1. `Queue` 策略下先取连接许可再调用 `accept`，许可不足时新连接留在监听队列；
///    `Reject` 策略下先 `accept`，再尝试取许可，失败即关闭该连接；
/// 2. 接受成功后开启 `TCP_NODELAY` 与 keepalive，原子地租借一对缓冲，
///    把 [`Connection`] 与许可一起交给独立任务中的读取器；
/// 3. `accept` 失败时记录日志并按错误分类退避，随后立即重新进入接受状态；
/// 4. 关闭信号到达后退出循环，已移交的连接通过 [`Connection::receive`] 感知关闭。
///
/// ## 契约 (What)
/// - 同时存活的连接数不超过 `max_connections`，同时在外的缓冲块不超过 `2 × max_connections`；
/// - 读取器无论正常返回、出错还是 panic，连接的两块缓冲都会归还；
/// - 单条连接的失败不会终止接入循环。
#[derive(Clone)]
pub struct ConnectionAcceptor {
    inner: Arc<AcceptorInner>,
}

struct AcceptorInner {
    options: AcceptorOptions,
    pool: BlockPool,
    reader: Arc<dyn ProtocolReader>,
    slots: Arc<Semaphore>,
    state: Mutex<AcceptorState>,
    connection_ids: AtomicSequence,
    accepted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    active: AtomicUsize,
    logger: Logger,
}

impl ConnectionAcceptor {
    pub fn new(
        options: AcceptorOptions,
        reader: Arc<dyn ProtocolReader>,
        logger: Logger,
    ) -> Result<Self> {
        options.validate()?;
        let pool = BlockPool::new(options.buffer_block_size, options.max_connections)?;
        Ok(Self {
            inner: Arc::new(AcceptorInner {
                slots: Arc::new(Semaphore::new(options.max_connections)),
                options,
                pool,
                reader,
                state: Mutex::new(AcceptorState::Idle),
                connection_ids: AtomicSequence::new(SequenceNumber::new(1)),
                accepted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                logger,
            }),
        })
    }

    pub fn options(&self) -> &AcceptorOptions {
        &self.inner.options
    }

    pub fn pool(&self) -> &BlockPool {
        &self.inner.pool
    }

    pub fn state(&self) -> AcceptorState {
        *self.inner.state.lock()
    }

    pub fn statistics(&self) -> AcceptorStats {
        let inner = &self.inner;
        AcceptorStats {
            accepted: inner.accepted.load(Ordering::Relaxed),
            rejected: inner.rejected.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
            active: inner.active.load(Ordering::Acquire),
        }
    }

    /// 按选项创建监听套接字，必须在 Tokio 运行时内调用。
    pub fn bind(&self) -> Result<TcpListener> {
        let addr = self.inner.options.listen_addr;
        let bind_err = |err| map_io_error(error::BIND, err);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(self.inner.options.backlog).map_err(bind_err)?;
        TcpListener::from_std(std::net::TcpListener::from(socket)).map_err(bind_err)
    }

    /// 运行接入循环，直到 `shutdown` 变为 `true` 或其发送端被丢弃。
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let inner = &self.inner;
        tracing::info!(
            parent: inner.logger.span(),
            listen_addr = ?listener.local_addr().ok(),
            max_connections = inner.options.max_connections,
            overflow = ?inner.options.overflow,
            "acceptor listening"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            inner.set_state(AcceptorState::Accepting);

            let reserved = match inner.options.overflow {
                OverflowPolicy::Queue => {
                    let slot = tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        slot = Arc::clone(&inner.slots).acquire_owned() => slot,
                    };
                    match slot {
                        Ok(slot) => Some(slot),
                        Err(_closed) => break,
                    }
                }
                OverflowPolicy::Reject => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let slot = match reserved {
                        Some(slot) => slot,
                        None => match Arc::clone(&inner.slots).try_acquire_owned() {
                            Ok(slot) => slot,
                            Err(_) => {
                                inner.rejected.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(
                                    parent: inner.logger.span(),
                                    peer = %peer,
                                    "connection limit reached, connection rejected"
                                );
                                continue;
                            }
                        },
                    };
                    inner.set_state(AcceptorState::Established);
                    self.hand_off(stream, peer, slot, shutdown.clone()).await;
                }
                Err(err) => {
                    inner.set_state(AcceptorState::AcceptFailed);
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    let err = map_io_error(error::ACCEPT, err);
                    let backoff = accept_backoff(&err, inner.options.accept_backoff);
                    tracing::warn!(
                        parent: inner.logger.span(),
                        code = err.code(),
                        error = %err,
                        backoff_ms = saturating_millis(backoff),
                        "accept failed"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        inner.set_state(AcceptorState::Stopped);
        tracing::info!(parent: inner.logger.span(), "acceptor stopped");
        Ok(())
    }

    /// 在 `budget` 内等待全部连接结束。
    pub async fn wait_idle(&self, budget: Duration) -> bool {
        let Ok(total) = u32::try_from(self.inner.options.max_connections) else {
            return false;
        };
        match tokio::time::timeout(budget, self.inner.slots.acquire_many(total)).await {
            Ok(_) => true,
            Err(_elapsed) => false,
        }
    }

    async fn hand_off(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        slot: OwnedSemaphorePermit,
        closing: watch::Receiver<bool>,
    ) {
        let inner = &self.inner;
        if let Err(err) = configure(&stream) {
            inner.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                parent: inner.logger.span(),
                peer = %peer,
                error = %err,
                "socket configuration failed"
            );
            return;
        }
        let blocks = match inner.pool.lease_pair().await {
            Ok(blocks) => blocks,
            Err(err) => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    parent: inner.logger.span(),
                    peer = %peer,
                    error = %err,
                    "buffer lease failed"
                );
                return;
            }
        };

        let id = inner.connection_ids.next();
        let connection =
            Connection::new(id, peer, stream, blocks, closing, inner.logger.clone());
        inner.accepted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            parent: inner.logger.span(),
            connection_id = %id,
            peer = %peer,
            "connection established"
        );

        let active = ActiveConnection::enter(Arc::clone(inner), slot);
        tokio::spawn(async move {
            let inner = Arc::clone(&active.inner);
            if let Err(err) = inner.reader.serve(connection).await {
                tracing::warn!(
                    parent: inner.logger.span(),
                    connection_id = %id,
                    code = err.code(),
                    error = %err,
                    "protocol reader failed"
                );
            }
            drop(active);
        });
    }
}

impl AcceptorInner {
    fn set_state(&self, state: AcceptorState) {
        *self.state.lock() = state;
    }
}

impl fmt::Debug for ConnectionAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAcceptor")
            .field("options", &self.inner.options)
            .field("state", &self.state())
            .field("stats", &self.statistics())
            .finish()
    }
}

/// 连接存活期间持有的计数与许可，读取器 panic 时同样随任务释放。
struct ActiveConnection {
    inner: Arc<AcceptorInner>,
    _slot: OwnedSemaphorePermit,
}

impl ActiveConnection {
    fn enter(inner: Arc<AcceptorInner>, slot: OwnedSemaphorePermit) -> Self {
        inner.active.fetch_add(1, Ordering::AcqRel);
        Self { inner, _slot: slot }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 接入失败后的等待时长：错误建议的延迟与配置下限取较大者。
fn accept_backoff(err: &CoreError, floor: Duration) -> Duration {
    match err.category() {
        ErrorCategory::Retryable(Some(delay)) => delay.max(floor),
        _ => floor,
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn configure(stream: &TcpStream) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|err| map_io_error(error::CONFIGURE, err))?;
    SockRef::from(stream)
        .set_keepalive(true)
        .map_err(|err| map_io_error(error::CONFIGURE, err))
}
