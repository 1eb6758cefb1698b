use std::{fmt, net::SocketAddr};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
};

use courier_buffer::BlockLease;
use courier_core::{Logger, Result, SequenceNumber};

use crate::error::{self, map_io_error};

/// 已接受的连接，独占一块发送缓冲与一块接收缓冲。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 协议读取器只面对“从接收块读、经发送块写”两种操作，不直接接触套接字或缓冲池；
/// - 连接的全部资源由同一个值持有，读取器返回或出错时随值一起释放。
///
/// ## 契约 (What)
/// - `receive` 每次至多读满接收块，对端关闭或接入器进入关闭流程时返回空切片；
/// - `send` 按块大小分段经发送块写出，保证整个负载写完才返回；
/// - 两块缓冲在值被丢弃时各自归还缓冲池，且恰好归还一次。
///
/// ## 注意事项 (Trade-offs)
/// - 发送需要一次从负载到发送块的拷贝，换取块大小对单次写入的硬上限。
pub struct Connection {
    id: SequenceNumber,
    peer: SocketAddr,
    stream: TcpStream,
    send: BlockLease,
    recv: BlockLease,
    closing: watch::Receiver<bool>,
    logger: Logger,
}

impl Connection {
    pub(crate) fn new(
        id: SequenceNumber,
        peer: SocketAddr,
        stream: TcpStream,
        (send, recv): (BlockLease, BlockLease),
        closing: watch::Receiver<bool>,
        logger: Logger,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            send,
            recv,
            closing,
            logger,
        }
    }

    pub fn id(&self) -> SequenceNumber {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// 单块容量，即一次 `receive` 的上限。
    pub fn block_size(&self) -> usize {
        self.recv.len()
    }

    /// 接入器是否已经进入关闭流程。
    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// 读取一批字节到接收块。
    pub async fn receive(&mut self) -> Result<&[u8]> {
        if self.is_closing() {
            return Ok(&[]);
        }
        let read = tokio::select! {
            biased;
            _ = self.closing.changed() => return Ok(&[]),
            read = self.stream.read(self.recv.as_mut_slice()) => read,
        };
        let len = read.map_err(|err| map_io_error(error::READ, err))?;
        Ok(&self.recv.as_slice()[..len])
    }

    /// 经发送块写出整个负载。
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let block = self.send.len();
        for chunk in payload.chunks(block) {
            self.send.as_mut_slice()[..chunk.len()].copy_from_slice(chunk);
            self.stream
                .write_all(&self.send.as_slice()[..chunk.len()])
                .await
                .map_err(|err| map_io_error(error::WRITE, err))?;
        }
        Ok(())
    }

    /// 关闭写方向，通知对端不再有数据。
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|err| map_io_error(error::WRITE, err))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("send_slot", &self.send.slot())
            .field("recv_slot", &self.recv.slot())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::debug!(
            parent: self.logger.span(),
            connection_id = %self.id,
            peer = %self.peer,
            "connection closed, buffers returned"
        );
    }
}
