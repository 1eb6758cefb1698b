#![deny(unsafe_code)]
#![doc = r#"
# courier-hosting

## 设计动机（Why）
- **定位**：把核心契约、进程内传输与内置 Broker 装配成一个可以启动和停止的总线；
- **架构角色**：应用只与 [`BusBuilder`] 和 [`Bus`] 打交道，下层 crate 的类型只在注册处理器、
  Behavior 与服务时出现。

## 核心契约（What）
- 配置来自 TOML（[`BusConfig::from_path`]）或代码（[`BusConfig::for_address`]），构建前统一校验；
- 管线在构建时冻结，分发 Behavior 总是最内层；
- 处理器可以从作用域解析 [`MessageSession`]，以当前消息的身份发送与回复；
- 日志订阅者由 [`install_tracing`] 显式安装，库代码本身只产出 `tracing` 事件。

## 实现策略（How）
- `build` 的顺序：校验配置 → 编译管线 → 创建发送端与出站句柄 → 创建接收端 → 可选地创建 Broker；
- `start` 先接收端后 Broker，`stop` 同序，两者共享一个超时预算。

## 风险与考量（Trade-offs）
- 未指定网络时使用进程级共享的内存网络，同进程内多个总线会按地址互相可见；
- Broker 只负责连接层，没有协议读取器时连接上的字节被读取后丢弃。
"#]

mod builder;
mod bus;
mod config;
mod outbox;
mod telemetry;

pub use builder::BusBuilder;
pub use bus::{Bus, BusStopReport};
pub use config::{BrokerConfig, BusConfig, ConfigError, OverflowSetting};
pub use outbox::{MessageSession, Outbox};
pub use telemetry::{TelemetryError, install_tracing};
