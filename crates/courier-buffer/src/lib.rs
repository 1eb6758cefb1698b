#![deny(unsafe_code)]

//! `courier-buffer` 为 Broker 连接提供固定块大小的缓冲池。
//!
//! # 模块定位（Why）
//! - 每个已接受的连接恰好持有一块发送缓冲与一块接收缓冲，池容量为 `2 × maxConnections`，
//!   连接数再多也不会额外分配，内存占用在启动时即确定。
//! - 缓冲以 RAII 租约的形式借出，`Drop` 时归还，调用方在任何退出路径上都不会泄漏块。
//!
//! # 设计概要（How）
//! - 自由链表使用 `spin::Mutex<Vec<Block>>` 保存预分配的 `BytesMut` 块；
//! - `tokio::sync::Semaphore` 的许可数等于块数，许可先于块被获取、晚于块被归还，
//!   因此持有许可即保证自由链表中存在可用块；
//! - 超出容量的异步租借在信号量上排队等待，同步租借立即失败。

mod pool;

pub use pool::{BlockLease, BlockPool, PoolStats};
