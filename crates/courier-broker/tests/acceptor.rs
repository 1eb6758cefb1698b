//! `acceptor` 集成测试：在回环地址上用真实套接字验证接入器的连接与缓冲契约。
//!
//! # 测试目标（Why）
//! - 读取器经接收块读、经发送块写，超过块大小的负载被分段写完；
//! - 连接关闭后两块缓冲归还，活跃计数回到零；
//! - 连接数达到上限时，`Queue` 策略让新连接在监听队列中等待，`Reject` 策略直接关闭；
//! - `stop` 通知存活连接结束并在时限内报告排空。
//!
//! # 结构安排（How）
//! - Broker 监听 `127.0.0.1:0`，客户端使用 `tokio::net::TcpStream`；
//! - 异步状态通过 `eventually` 轮询统计快照，避免固定时长的睡眠。

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use courier_broker::{
    AcceptorOptions, AcceptorState, Broker, Connection, DrainReader, OverflowPolicy,
    ProtocolReader,
};
use courier_core::{Logger, Result, async_trait, codes};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

/// 原样回写收到的字节。
struct EchoReader;

#[async_trait]
impl ProtocolReader for EchoReader {
    async fn serve(&self, mut connection: Connection) -> Result<()> {
        loop {
            let received = connection.receive().await?.to_vec();
            if received.is_empty() {
                return Ok(());
            }
            connection.send(&received).await?;
        }
    }
}

fn loopback() -> AcceptorOptions {
    AcceptorOptions::new(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
}

fn broker(options: AcceptorOptions, reader: Arc<dyn ProtocolReader>) -> Broker {
    Broker::new(options, reader, Logger::new("test.broker")).expect("合法选项")
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "等待超时：{what}");
        sleep(Duration::from_millis(10)).await;
    }
}

/// 回写超过块大小的负载，并在客户端断开后归还缓冲。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_round_trip_releases_buffers_on_close() {
    let broker = broker(loopback().with_buffer_block_size(16), Arc::new(EchoReader));
    let addr = broker.start().await.expect("启动");

    let mut client = TcpStream::connect(addr).await.expect("连接");
    let payload: Vec<u8> = (0..100u8).collect();
    client.write_all(&payload).await.expect("写入");
    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(3), client.read_exact(&mut echoed))
        .await
        .expect("回写应在时限内到达")
        .expect("读取");
    assert_eq!(echoed, payload);

    let acceptor = broker.acceptor().clone();
    eventually("连接被接受", || acceptor.statistics().active == 1).await;
    assert_eq!(acceptor.pool().statistics().active_leases, 2);

    drop(client);
    eventually("连接关闭", || acceptor.statistics().active == 0).await;
    assert_eq!(acceptor.pool().statistics().active_leases, 0);
    assert_eq!(acceptor.statistics().accepted, 1);

    let report = broker.stop(Duration::from_secs(1)).await.expect("停止");
    assert!(report.drained);
    assert_eq!(acceptor.state(), AcceptorState::Stopped);
}

/// 达到上限后新连接留在监听队列，直到已有连接关闭。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_policy_defers_excess_connections() {
    let broker = broker(
        loopback().with_max_connections(1).with_buffer_block_size(32),
        Arc::new(EchoReader),
    );
    let addr = broker.start().await.expect("启动");
    let acceptor = broker.acceptor().clone();

    let first = TcpStream::connect(addr).await.expect("第一条连接");
    eventually("第一条连接被接受", || acceptor.statistics().accepted == 1).await;

    let mut second = TcpStream::connect(addr).await.expect("第二条连接进入监听队列");
    second.write_all(b"ping").await.expect("写入");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(acceptor.statistics().accepted, 1, "超出上限的连接不得被接受");
    assert_eq!(acceptor.pool().statistics().active_leases, 2);

    drop(first);
    let mut echoed = [0u8; 4];
    timeout(Duration::from_secs(3), second.read_exact(&mut echoed))
        .await
        .expect("第一条连接关闭后第二条应被服务")
        .expect("读取");
    assert_eq!(&echoed, b"ping");
    assert_eq!(acceptor.statistics().accepted, 2);
    assert_eq!(acceptor.statistics().rejected, 0);

    drop(second);
    broker.stop(Duration::from_secs(1)).await.expect("停止");
}

/// `Reject` 策略下超出上限的连接被立即关闭并计数。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reject_policy_closes_excess_connections() {
    let broker = broker(
        loopback()
            .with_max_connections(1)
            .with_overflow(OverflowPolicy::Reject),
        Arc::new(DrainReader),
    );
    let addr = broker.start().await.expect("启动");
    let acceptor = broker.acceptor().clone();

    let _held = TcpStream::connect(addr).await.expect("第一条连接");
    eventually("第一条连接被接受", || acceptor.statistics().active == 1).await;

    let mut excess = TcpStream::connect(addr).await.expect("TCP 握手由内核完成");
    let mut buf = [0u8; 8];
    let closed = timeout(Duration::from_secs(3), excess.read(&mut buf))
        .await
        .expect("被拒绝的连接应很快关闭");
    assert!(matches!(closed, Ok(0) | Err(_)));
    eventually("拒绝被计数", || acceptor.statistics().rejected == 1).await;
    assert_eq!(acceptor.statistics().accepted, 1);

    broker.stop(Duration::from_secs(1)).await.expect("停止");
}

/// 停止时存活连接感知关闭信号并结束，报告排空。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_closes_live_connections_and_drains() {
    let broker = broker(loopback(), Arc::new(DrainReader));
    let addr = broker.start().await.expect("启动");
    let acceptor = broker.acceptor().clone();

    let mut client = TcpStream::connect(addr).await.expect("连接");
    eventually("连接被接受", || acceptor.statistics().active == 1).await;

    let report = broker.stop(Duration::from_secs(2)).await.expect("停止");
    assert!(report.drained);
    assert_eq!(report.in_flight, 0);
    assert_eq!(acceptor.pool().statistics().active_leases, 0);
    assert!(broker.local_addr().is_none());

    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("服务端关闭后客户端读到结束");
    assert!(matches!(read, Ok(0) | Err(_)));
}

/// 重复启动报错，停止后可以在新端口上重新启动。
#[tokio::test]
async fn double_start_is_rejected_and_restart_is_allowed() {
    let broker = broker(loopback(), Arc::new(DrainReader));
    let addr = broker.start().await.expect("启动");
    assert_eq!(broker.local_addr(), Some(addr));

    let err = broker.start().await.err().expect("重复启动");
    assert_eq!(err.code(), codes::TRANSPORT_ALREADY_STARTED);

    broker.stop(Duration::from_secs(1)).await.expect("停止");
    let again = broker.start().await.expect("再次启动");
    TcpStream::connect(again).await.expect("新的监听地址可连接");
    broker.stop(Duration::from_secs(1)).await.expect("停止");
}
