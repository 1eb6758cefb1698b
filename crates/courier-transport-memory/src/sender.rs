use async_trait::async_trait;

use courier_core::{
    Envelope, Logger, Result, headers,
    transport::{DeliveryReport, Sender, distinct_destinations},
};

use crate::network::InMemoryNetwork;

/// 进程内发送端。
///
/// 每个目的地址收到一份独立的信封副本；未盖章的信封先获得网络内唯一的消息编号，
/// 因此同一次发送的所有副本共享同一编号。
#[derive(Clone, Debug)]
pub struct InMemorySender {
    network: InMemoryNetwork,
    logger: Logger,
}

impl InMemorySender {
    pub fn new(network: InMemoryNetwork, logger: Logger) -> Self {
        Self { network, logger }
    }
}

#[async_trait]
impl Sender for InMemorySender {
    async fn send(
        &self,
        mut envelope: Envelope,
        destinations: &[String],
    ) -> Result<DeliveryReport> {
        if envelope.message_id().is_none() {
            let id = self.network.next_message_id();
            envelope
                .headers_mut()
                .insert(headers::MESSAGE_ID, id.to_string());
        }

        let mut report = DeliveryReport::default();
        for address in distinct_destinations(destinations) {
            match self.network.queue(address).enqueue(envelope.clone()) {
                Ok(()) => report.delivered.push(address.to_owned()),
                Err(failure) => {
                    tracing::warn!(
                        parent: self.logger.span(),
                        address,
                        error = %failure,
                        "enqueue rejected"
                    );
                    report.failed.push(failure);
                }
            }
        }
        Ok(report)
    }
}
