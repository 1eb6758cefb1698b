//! `end_to_end` 集成测试：经由 `BusBuilder` 装配的完整总线。
//!
//! # 测试目标（Why）
//! - 单并发总线按发送顺序、每条恰好一次地把消息交给处理器；
//! - 处理器通过作用域中的 `MessageSession` 回复，回复带上原消息编号；
//! - 重试耗尽与无处理器两种失败都落到毒消息地址；
//! - 配置中的 `broker` 段使总线随 `start` / `stop` 启停 TCP 监听。
//!
//! # 结构安排（How）
//! - 每个测试使用独立的 `InMemoryNetwork`，互不干扰；
//! - 异步结果通过 `eventually` 轮询，避免固定时长的睡眠。

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use courier_core::{
    CoreError, Envelope, Message, MissingHandlerPolicy, Sender, ServiceMap, TransportFactory,
    codes, headers,
};
use courier_hosting::{BrokerConfig, Bus, BusBuilder, BusConfig, MessageSession};
use courier_transport_memory::{InMemoryNetwork, InMemoryTransport};
use tokio::{net::TcpStream, time::sleep};
use tracing_test::traced_test;

#[derive(Debug)]
struct Ping(u32);

impl Message for Ping {}

#[derive(Debug)]
struct Quote {
    sku: &'static str,
}

impl Message for Quote {}

#[derive(Debug)]
struct Price(u64);

impl Message for Price {}

#[derive(Default)]
struct Journal {
    seen: Mutex<Vec<u32>>,
}

impl Journal {
    fn snapshot(&self) -> Vec<u32> {
        self.seen.lock().expect("日志锁").clone()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "等待超时：{what}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn assemble(
    config: BusConfig,
    network: &InMemoryNetwork,
    build: impl FnOnce(&mut BusBuilder),
) -> Bus {
    let mut builder = BusBuilder::new(config);
    builder.network(network.clone());
    build(&mut builder);
    builder.build().expect("合法的总线配置")
}

/// 启动前积压的五条消息按发送顺序各处理一次。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_slot_bus_handles_messages_in_send_order() {
    let network = InMemoryNetwork::new();
    let journal = Arc::new(Journal::default());
    let bus = assemble(BusConfig::for_address("Q"), &network, |builder| {
        builder
            .resolver(Arc::new(ServiceMap::new().with_singleton_arc(Arc::clone(&journal))));
        builder
            .handlers()
            .handle_with("record-ping", |ping: Arc<Ping>, journal: Arc<Journal>| async move {
                journal.seen.lock().expect("日志锁").push(ping.0);
                Ok(())
            });
    });

    for n in 1..=5 {
        bus.send_local(Ping(n)).await.expect("本地投递");
    }
    bus.start().await.expect("启动总线");
    eventually("五条消息处理完毕", || journal.snapshot().len() == 5).await;

    let report = bus.shutdown().await.expect("停止总线");
    assert!(report.drained());
    assert_eq!(journal.snapshot(), vec![1, 2, 3, 4, 5]);
    let status = network.status("Q").expect("队列已创建");
    assert_eq!(status.pending, 0);
    assert_eq!(status.poison_count, 0);
}

/// 处理器经会话回复，回复投递到请求方地址并携带原消息编号。
#[tokio::test]
async fn session_reply_carries_correlation_id() {
    let network = InMemoryNetwork::new();
    let pricing = assemble(BusConfig::for_address("pricing"), &network, |builder| {
        builder.handlers().handle_with(
            "quote",
            |quote: Arc<Quote>, session: Arc<MessageSession>| async move {
                assert_eq!(session.reply_address(), Some("shop"));
                let price = if quote.sku == "apple" { 3 } else { 0 };
                session.reply(Price(price)).await
            },
        );
    });
    let shop = assemble(BusConfig::for_address("shop"), &network, |_| {});

    let mut request = Envelope::new(Quote { sku: "apple" });
    request.headers_mut().insert(headers::MESSAGE_ID, "req-1");
    let report = shop
        .send_envelope(request, &["pricing".to_owned()])
        .await
        .expect("发送请求");
    assert!(report.is_complete());

    pricing.start().await.expect("启动定价端");
    eventually("回复到达", || {
        network.status("shop").is_some_and(|status| status.pending == 1)
    })
    .await;
    pricing.shutdown().await.expect("停止定价端");

    let replies = network.drain("shop");
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.downcast::<Price>().expect("回复类型").0, 3);
    assert_eq!(reply.headers().get(headers::CORRELATION_ID), Some("req-1"));
    assert_eq!(reply.headers().get(headers::RETURN_ADDRESS), Some("pricing"));
}

/// 没有回复地址时回复失败，错误不可重试，消息直接进入毒消息地址。
#[tokio::test]
async fn reply_without_return_address_is_poisoned() {
    let network = InMemoryNetwork::new();
    let bus = assemble(BusConfig::for_address("pricing"), &network, |builder| {
        builder.handlers().handle_with(
            "quote",
            |_quote: Arc<Quote>, session: Arc<MessageSession>| async move {
                session.reply(Price(1)).await
            },
        );
    });

    // 绕过出站句柄，信封不带回复地址。
    let raw = InMemoryTransport::new(network.clone())
        .create_sender()
        .expect("创建发送端");
    raw.send(Envelope::new(Quote { sku: "pear" }), &["pricing".to_owned()])
        .await
        .expect("直接入队");

    bus.start().await.expect("启动");
    eventually("进入毒消息地址", || {
        network
            .status("pricing.poison")
            .is_some_and(|status| status.pending == 1)
    })
    .await;
    bus.shutdown().await.expect("停止");

    let poisoned = network.drain("pricing.poison");
    let details = poisoned[0].headers().get(headers::ERROR_DETAILS).expect("错误详情");
    assert!(details.contains(codes::TRANSPORT_NO_REPLY_ADDRESS));
    assert_eq!(poisoned[0].headers().get(headers::DELIVERY_ATTEMPTS), Some("1"));
}

/// 持续失败的处理器在 `max_retries + 1` 次尝试后把消息送入毒消息地址。
#[tokio::test]
async fn exhausted_retries_reach_poison_address() {
    let network = InMemoryNetwork::new();
    let calls = Arc::new(AtomicU32::new(0));
    let mut config = BusConfig::for_address("flaky");
    config.max_retries = 2;
    let bus = {
        let calls = Arc::clone(&calls);
        assemble(config, &network, move |builder| {
            builder.handlers().handle("always-fails", move |_ping: Arc<Ping>| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(CoreError::handler_failure("downstream unavailable"))
                }
            });
        })
    };

    bus.send_local(Ping(7)).await.expect("本地投递");
    bus.start().await.expect("启动");
    eventually("进入毒消息地址", || {
        network
            .status("flaky.poison")
            .is_some_and(|status| status.pending == 1)
    })
    .await;
    bus.shutdown().await.expect("停止");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let poisoned = network.drain("flaky.poison");
    assert_eq!(poisoned[0].downcast::<Ping>().expect("原始负载").0, 7);
    assert_eq!(poisoned[0].headers().get(headers::DELIVERY_ATTEMPTS), Some("3"));
    assert_eq!(network.status("flaky").expect("源队列").poison_count, 1);
}

/// 没有处理器且策略为失败时，消息只尝试一次；策略为忽略时视为成功。
#[tokio::test]
async fn missing_handler_policy_decides_fate() {
    let network = InMemoryNetwork::new();
    let mut strict_config = BusConfig::for_address("strict");
    strict_config.max_retries = 5;
    let strict = assemble(strict_config, &network, |builder| {
        builder.missing_handler(MissingHandlerPolicy::Fail);
    });
    let lenient = assemble(BusConfig::for_address("lenient"), &network, |builder| {
        builder.missing_handler(MissingHandlerPolicy::Ignore);
    });

    strict.send_local(Ping(1)).await.expect("投递");
    lenient.send_local(Ping(2)).await.expect("投递");
    strict.start().await.expect("启动");
    lenient.start().await.expect("启动");

    eventually("严格端进入毒消息地址", || {
        network
            .status("strict.poison")
            .is_some_and(|status| status.pending == 1)
    })
    .await;
    eventually("宽松端出队", || {
        network
            .status("lenient")
            .is_some_and(|status| status.delivered == 1)
    })
    .await;
    strict.shutdown().await.expect("停止");
    lenient.shutdown().await.expect("停止");

    let poisoned = network.drain("strict.poison");
    assert_eq!(poisoned[0].headers().get(headers::DELIVERY_ATTEMPTS), Some("1"));
    assert!(network.status("lenient.poison").is_none());
}

/// 用户 Behavior 排在分发之前，重名注册被拒绝。
#[test]
fn dispatch_is_the_innermost_behavior() {
    use courier_core::{
        ChainOutcome, MessageContext, Result, async_trait,
        pipeline::{Behavior, BehaviorDescriptor, Next},
    };

    struct Audit;

    #[async_trait]
    impl Behavior for Audit {
        fn descriptor(&self) -> BehaviorDescriptor {
            BehaviorDescriptor::anonymous("audit")
        }

        async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<ChainOutcome> {
            next.run(ctx).await
        }
    }

    let mut builder = BusBuilder::new(BusConfig::for_address("audited"));
    builder.network(InMemoryNetwork::new());
    builder.behavior(Arc::new(Audit)).expect("首次注册");
    let err = builder
        .behavior(Arc::new(Audit))
        .err()
        .expect("重名注册");
    assert_eq!(err.code(), codes::PIPELINE_DUPLICATE_BEHAVIOR);

    let bus = builder.build().expect("构建");
    assert_eq!(bus.behavior_names(), vec!["audit".to_owned(), "dispatch".to_owned()]);
}

/// 配置了 `broker` 段的总线随启停开关 TCP 监听。
#[tokio::test]
#[traced_test]
async fn broker_follows_bus_lifecycle() {
    let mut config = BusConfig::for_address("edge");
    config.broker = Some(BrokerConfig {
        listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: 0,
        ..BrokerConfig::default()
    });
    let bus = assemble(config, &InMemoryNetwork::new(), |_| {});
    assert!(bus.broker_addr().is_none());

    bus.start().await.expect("启动");
    let addr = bus.broker_addr().expect("监听地址");
    let client = TcpStream::connect(addr).await.expect("连接 Broker");
    let broker = bus.broker().expect("已配置 Broker");
    eventually("连接被接受", || broker.acceptor().statistics().accepted == 1).await;

    let report = bus.stop(Duration::from_secs(2)).await.expect("停止");
    assert!(report.drained());
    assert!(report.broker.is_some());
    assert!(bus.broker_addr().is_none());
    drop(client);
    assert!(logs_contain("bus started"));
    assert!(logs_contain("bus stopped"));
}

/// 重复启动返回已启动错误，接收端保持运行。
#[tokio::test]
async fn second_start_is_rejected() {
    let bus = assemble(BusConfig::for_address("twice"), &InMemoryNetwork::new(), |_| {});
    bus.start().await.expect("首次启动");
    let err = bus.start().await.err().expect("重复启动");
    assert_eq!(err.code(), codes::TRANSPORT_ALREADY_STARTED);
    assert!(bus.shutdown().await.expect("停止").drained());
}
