use async_trait::async_trait;

use courier_core::Result;

use crate::connection::Connection;

/// 协议读取器：接管一条已建立的连接直到其关闭。
///
/// - 读取器独占 [`Connection`]，返回即意味着连接结束，缓冲随之归还；
/// - 返回错误只影响这一条连接，接入器记录日志后继续服务其他连接；
/// - 帧格式与会话状态完全由实现者决定，接入器不解析任何字节。
#[async_trait]
pub trait ProtocolReader: Send + Sync + 'static {
    async fn serve(&self, connection: Connection) -> Result<()>;
}

/// 读完对端数据后直接关闭连接，不做任何回应。
#[derive(Clone, Copy, Debug, Default)]
pub struct DrainReader;

#[async_trait]
impl ProtocolReader for DrainReader {
    async fn serve(&self, mut connection: Connection) -> Result<()> {
        while !connection.receive().await?.is_empty() {}
        Ok(())
    }
}
