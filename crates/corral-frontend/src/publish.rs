//! The front-end's side of the broker protocol. Behind a trait so the HTTP
//! surface can be exercised without a live broker.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use corral_base::proto::{BrokerToPublisher, Hello, PublisherToBroker};
use corral_util::{config::BrokerAddr, net};
use tokio::net::TcpStream;

#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Durably enqueue `body` on `queue`. Returns only once the broker has
    /// confirmed the message is journaled.
    async fn publish(&self, queue: &str, body: &str) -> Result<()>;
}

pub struct BrokerPublisher {
    addr: BrokerAddr,
}

impl BrokerPublisher {
    pub fn new(addr: BrokerAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl JobPublisher for BrokerPublisher {
    // One connection per publish. TODO: pool broker connections.
    async fn publish(&self, queue: &str, body: &str) -> Result<()> {
        let mut stream = TcpStream::connect(self.addr.inner()).await?;
        net::write_message_to_async_socket(&mut stream, Hello::Publisher).await?;
        net::write_message_to_async_socket(
            &mut stream,
            PublisherToBroker::Publish {
                queue: queue.to_string(),
                body: body.to_string(),
            },
        )
        .await?;
        match net::read_message_from_async_socket(&mut stream).await? {
            BrokerToPublisher::Published => Ok(()),
            BrokerToPublisher::Rejected(reason) => {
                Err(anyhow!("broker rejected publish: {reason}"))
            }
        }
    }
}
