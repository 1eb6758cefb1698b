//! 环绕安全的 32 位序号。
//!
//! # 设计背景（Why）
//! - 队列与 Broker 需要单调递增的序号做顺序与流控记账，但 32 位计数器迟早会回绕；
//!   以“环形距离”定义大小关系，回绕点两侧的比较结果依旧正确。
//!
//! # 契约说明（What）
//! - `a > b` 当且仅当 `(a - b) mod 2^32 ∈ [1, 2^31 - 1]`；
//! - 距离恰为 `2^31` 的两个值互不大于对方，[`SequenceNumber::compare`] 返回 `None`；
//! - 该关系不满足传递性，因此 [`SequenceNumber`] 刻意不实现 `PartialOrd`/`Ord`。

use std::{
    cmp::Ordering,
    fmt,
    sync::atomic::{AtomicU32, Ordering as AtomicOrdering},
};

const HALF_RANGE: u32 = 1 << 31;

/// 环绕序号。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// 下一个序号，`u32::MAX` 之后回到 `0`。
    #[must_use]
    pub const fn increment(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// 前进 `steps` 步。
    #[must_use]
    pub const fn advance(self, steps: u32) -> Self {
        Self(self.0.wrapping_add(steps))
    }

    /// 从 `earlier` 到 `self` 的环形距离。
    pub const fn distance_from(self, earlier: SequenceNumber) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// 按环形关系比较；距离为 `2^31` 时无法判定，返回 `None`。
    pub fn compare(self, other: SequenceNumber) -> Option<Ordering> {
        match self.distance_from(other) {
            0 => Some(Ordering::Equal),
            diff if diff < HALF_RANGE => Some(Ordering::Greater),
            HALF_RANGE => None,
            _ => Some(Ordering::Less),
        }
    }

    /// `self` 是否在环形意义上晚于 `other`。
    pub fn is_after(self, other: SequenceNumber) -> bool {
        self.compare(other) == Some(Ordering::Greater)
    }
}

impl fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u32> for SequenceNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// 可跨线程共享的序号发生器。
///
/// `next` 返回当前值并原子地前进一步；`fetch_add` 在溢出时自然回绕，与 [`SequenceNumber::increment`] 一致。
#[derive(Debug, Default)]
pub struct AtomicSequence {
    current: AtomicU32,
}

impl AtomicSequence {
    pub const fn new(start: SequenceNumber) -> Self {
        Self {
            current: AtomicU32::new(start.0),
        }
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.current.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// 下一次 `next` 将返回的值。
    pub fn peek(&self) -> SequenceNumber {
        SequenceNumber(self.current.load(AtomicOrdering::Relaxed))
    }
}
