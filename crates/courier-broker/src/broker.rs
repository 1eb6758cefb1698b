use std::{
    mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use spin::Mutex;
use tokio::{sync::watch, task::JoinHandle};

use courier_core::{Logger, Result, transport::StopReport};

use crate::{
    acceptor::{AcceptorOptions, ConnectionAcceptor},
    error::{self, AcceptorError, map_io_error},
    reader::ProtocolReader,
};

/// 内置 Broker 的宿主：持有接入器并管理其后台任务。
///
/// - `start` 绑定监听地址并在后台运行接入循环，返回实际监听地址（端口为 0 时由系统分配）；
/// - `stop(timeout)` 发出关闭信号，等待接入循环退出与全部连接结束，总等待不超过 `timeout`；
/// - 停止后可以再次 `start`，统计与连接编号延续之前的值。
pub struct Broker {
    acceptor: ConnectionAcceptor,
    state: Mutex<BrokerState>,
    logger: Logger,
}

enum BrokerState {
    Idle,
    Running {
        local_addr: SocketAddr,
        shutdown: watch::Sender<bool>,
        accept_loop: JoinHandle<Result<()>>,
    },
    Stopped,
}

impl Broker {
    pub fn new(
        options: AcceptorOptions,
        reader: Arc<dyn ProtocolReader>,
        logger: Logger,
    ) -> Result<Self> {
        Ok(Self {
            acceptor: ConnectionAcceptor::new(options, reader, logger.clone())?,
            state: Mutex::new(BrokerState::Idle),
            logger,
        })
    }

    pub fn acceptor(&self) -> &ConnectionAcceptor {
        &self.acceptor
    }

    /// 正在运行时的监听地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            BrokerState::Running { local_addr, .. } => Some(*local_addr),
            BrokerState::Idle | BrokerState::Stopped => None,
        }
    }

    pub async fn start(&self) -> Result<SocketAddr> {
        let mut state = self.state.lock();
        if let BrokerState::Running { local_addr, .. } = &*state {
            return Err(AcceptorError::AlreadyRunning(*local_addr).into());
        }
        let listener = self.acceptor.bind()?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        let (shutdown, signal) = watch::channel(false);
        let acceptor = self.acceptor.clone();
        let accept_loop = tokio::spawn(async move { acceptor.run(listener, signal).await });
        tracing::info!(parent: self.logger.span(), local_addr = %local_addr, "broker started");
        *state = BrokerState::Running {
            local_addr,
            shutdown,
            accept_loop,
        };
        Ok(local_addr)
    }

    pub async fn stop(&self, timeout: Duration) -> Result<StopReport> {
        let started = Instant::now();
        let previous = mem::replace(&mut *self.state.lock(), BrokerState::Stopped);
        let BrokerState::Running {
            shutdown,
            accept_loop,
            ..
        } = previous
        else {
            return Ok(StopReport {
                drained: true,
                in_flight: 0,
                elapsed: started.elapsed(),
            });
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(timeout, accept_loop).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                tracing::warn!(
                    parent: self.logger.span(),
                    error = %err,
                    "accept loop ended with error"
                );
            }
            Ok(Err(join)) => {
                tracing::error!(
                    parent: self.logger.span(),
                    error = %join,
                    "accept loop terminated abnormally"
                );
            }
            Err(_) => {
                tracing::warn!(
                    parent: self.logger.span(),
                    "accept loop did not exit before timeout"
                );
            }
        }

        let drained = self
            .acceptor
            .wait_idle(timeout.saturating_sub(started.elapsed()))
            .await;
        let report = StopReport {
            drained,
            in_flight: self.acceptor.statistics().active,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            parent: self.logger.span(),
            drained = report.drained,
            in_flight = report.in_flight,
            "broker stopped"
        );
        Ok(report)
    }
}
