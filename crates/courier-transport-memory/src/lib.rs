#![deny(unsafe_code)]
#![doc = r#"
# courier-transport-memory

## 设计动机（Why）
- **定位**：进程内的命名队列传输，既是单进程部署的默认传输，也是
  [`courier_core::transport`] 契约的参考实现，测试可以不经网络验证整条收发链路。
- **架构角色**：发送端把信封副本追加到目标队列，接收端的拉取循环把消息交给
  [`InboundProcessor`](courier_core::InboundProcessor)。

## 核心契约（What）
- 队列按名称在首次发送或首次接收时惰性创建，之后永不删除，同名的所有发送端与接收端共享；
- 队列是无界 FIFO，附带一个电平触发的就绪信号：没有等待者时的通知会被记住；
- 同一队列上的多个接收端互为竞争消费者，每条消息只交给其中一个；
- 重试耗尽的消息被复制到毒消息地址，并在源队列的状态中计数。

## 实现策略（How）
- 队列注册表是 `DashMap<String, Arc<MemoryQueue>>`，可以是显式创建的
  [`InMemoryNetwork`] 值，也可以是进程级共享实例 [`InMemoryNetwork::shared`]；
- 就绪信号使用 `tokio::sync::Notify`，`notify_one` 在无人等待时保留一个许可；
- 接收端以 `Semaphore` 限制并发，每次出队前先取许可，`maxConcurrency = 1` 时严格按序处理。

## 风险与考量（Trade-offs）
- 队列无界，生产速度长期高于消费速度时内存会持续增长；
- 进程退出即丢失全部消息，不提供持久化。
"#]

mod network;
mod receiver;
mod sender;
mod transport;

pub use network::{InMemoryNetwork, QueueStatus};
pub use receiver::{InMemoryReceiver, ReceiveListener};
pub use sender::InMemorySender;
pub use transport::InMemoryTransport;
