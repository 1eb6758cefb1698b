#![deny(unsafe_code)]
#![doc = r#"
# courier-broker

## 设计动机（Why）
- **定位**：内置 Broker 的连接层，负责在 Tokio 上异步接受 TCP 连接，并把每条连接连同
  一对固定大小的缓冲块交给协议读取器。
- **架构角色**：位于 [`courier_buffer::BlockPool`] 之上；帧编码与会话状态机不在本 crate 内，
  由实现 [`ProtocolReader`] 的上层提供。

## 核心契约（What）
- 同时服务的连接数不超过 `max_connections`，缓冲池容量固定为其两倍，接入路径上从不分配新缓冲；
- 连接在关闭或出错的所有路径上归还两块缓冲，且恰好归还一次；
- `accept` 失败被记录并退避后立即重新接受，单条连接的故障不影响接入循环。

## 实现策略（How）
- 监听套接字由 `socket2` 构造，以便设置 `SO_REUSEADDR` 与监听队列长度；
- 连接许可用 `tokio::sync::Semaphore` 表达，`Queue` 策略下在 `accept` 之前取许可，
  多余的连接停留在内核监听队列；
- 关闭信号经 `watch` 通道同时送达接入循环与所有存活连接。

## 风险与考量（Trade-offs）
- 读取器的取消是协作式的：只在 [`Connection::receive`] 处感知关闭，长时间不读取的读取器会拖慢 `stop`；
- 未实现 TLS 与 AMQP 帧解析。
"#]

mod acceptor;
mod broker;
mod connection;
mod error;
mod reader;

pub use acceptor::{
    AcceptorOptions, AcceptorState, AcceptorStats, ConnectionAcceptor, OverflowPolicy,
};
pub use broker::Broker;
pub use connection::Connection;
pub use error::AcceptorError;
pub use reader::{DrainReader, ProtocolReader};

/// Broker 默认监听端口。
pub const DEFAULT_BROKER_PORT: u16 = 5672;
