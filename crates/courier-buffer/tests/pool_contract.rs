//! `pool_contract` 集成测试：验证 `BlockPool` 在真实异步调用路径下的容量契约。
//!
//! # 测试目标（Why）
//! - 容量为 `C` 时前 `C` 次租借立即成功，第 `C + 1` 次必须等待，绝不额外分配；
//! - 归还一块后等待者恰好拿到被归还的那一块；
//! - 关闭池会唤醒所有等待者并返回 `buffer.pool_closed`。
//!
//! # 结构安排（How）
//! - 使用多线程运行时并把等待中的租借放入独立任务，通过 `is_finished` 与统计快照观察挂起状态。

use std::time::Duration;

use courier_buffer::BlockPool;
use courier_core::{ErrorCategory, codes};
use tokio::time::{sleep, timeout};

const CAPACITY: usize = 4;

/// 第 `C + 1` 次租借挂起，直到某个租约被释放，并复用同一槽位。
///
/// # 步骤说明（How）
/// 1. 依次租出全部 `C` 块并记录槽位；
/// 2. 在后台任务中发起第 `C + 1` 次租借，短暂等待后确认任务仍未完成、等待计数为 1；
/// 3. 释放第三块，确认后台任务在超时之前拿到同一槽位。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lease_beyond_capacity_waits_for_release() {
    let pool = BlockPool::with_capacity(64, CAPACITY).expect("合法参数");
    let mut leases = Vec::new();
    for _ in 0..CAPACITY {
        leases.push(pool.lease().await.expect("容量内租借"));
    }
    assert_eq!(pool.statistics().active_leases, CAPACITY);
    assert_eq!(pool.statistics().available_blocks, 0);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.lease().await.map(|lease| lease.slot()) })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "超出容量的租借必须等待");
    assert_eq!(pool.statistics().pending_lease_requests, 1);

    let released = leases.remove(2);
    let released_slot = released.slot();
    drop(released);

    let slot = timeout(Duration::from_secs(2), waiter)
        .await
        .expect("释放后应被唤醒")
        .expect("任务未 panic")
        .expect("租借成功");
    assert_eq!(slot, released_slot);
    assert_eq!(pool.statistics().pending_lease_requests, 0);
    assert_eq!(pool.statistics().total_leases, (CAPACITY + 1) as u64);
}

/// 成对租借在只剩一块时等待，而不是先占住一块。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pair_lease_waits_without_holding_a_block() {
    let pool = BlockPool::new(32, 1).expect("合法参数");
    let first = pool.lease().await.expect("第一块");

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.lease_pair().await.map(|(a, b)| (a.slot(), b.slot())) })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(pool.statistics().available_blocks, 1, "等待者不得预占剩余的块");

    drop(first);
    let (a, b) = timeout(Duration::from_secs(2), waiter)
        .await
        .expect("释放后应被唤醒")
        .expect("任务未 panic")
        .expect("成对租借");
    assert_ne!(a, b);
    assert_eq!(pool.statistics().active_leases, 0);
}

/// 关闭池后等待者立即失败，已借出的块仍能归还。
#[tokio::test]
async fn close_fails_pending_leases() {
    let pool = BlockPool::with_capacity(8, 1).expect("合法参数");
    let held = pool.lease().await.expect("唯一的块");

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.lease().await.map(|lease| lease.slot()) })
    };
    tokio::task::yield_now().await;
    pool.close();

    let err = waiter
        .await
        .expect("任务未 panic")
        .err()
        .expect("关闭后租借失败");
    assert_eq!(err.code(), codes::BUFFER_POOL_CLOSED);
    assert_eq!(err.category(), ErrorCategory::Cancelled);

    drop(held);
    assert_eq!(pool.statistics().available_blocks, 1);
    assert!(pool.try_lease().is_err());
}
