//! The worker's side of the broker protocol: a subscription that yields one
//! delivery at a time and acks each after disposition.

use anyhow::{Context as _, Result};
use corral_base::proto::{BrokerToConsumer, ConsumerToBroker, Hello};
use corral_util::{config::BrokerAddr, net};
use tokio::{
    io::BufReader,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

pub struct Delivery {
    pub delivery_id: u64,
    pub body: String,
}

pub struct BrokerConsumer {
    read: BufReader<OwnedReadHalf>,
    write: OwnedWriteHalf,
}

impl BrokerConsumer {
    pub async fn connect(addr: BrokerAddr, queue: &str, tag: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr.inner())
            .await
            .context("connecting to broker")?;
        stream.set_nodelay(true).ok();
        let (read, mut write) = stream.into_split();
        net::write_message_to_async_socket(
            &mut write,
            Hello::Consumer {
                queue: queue.to_string(),
                tag: tag.to_string(),
            },
        )
        .await?;
        Ok(Self {
            read: BufReader::new(read),
            write,
        })
    }

    /// Wait for the next delivery. `None` means the subscription ended.
    pub async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        match net::read_message_from_async_socket(&mut self.read).await? {
            BrokerToConsumer::Delivery { delivery_id, body } => {
                Ok(Some(Delivery { delivery_id, body }))
            }
            BrokerToConsumer::Canceled => Ok(None),
        }
    }

    /// Tell the broker this delivery has been handled, whatever the
    /// outcome. Only then will the next delivery arrive.
    pub async fn ack(&mut self, delivery_id: u64) -> Result<()> {
        net::write_message_to_async_socket(&mut self.write, ConsumerToBroker::Ack { delivery_id })
            .await
    }

    /// End the subscription cleanly and wait for the broker to confirm. A
    /// delivery that raced the cancellation is discarded un-acked, so the
    /// broker will hand it to another worker.
    pub async fn cancel(mut self) -> Result<()> {
        net::write_message_to_async_socket(&mut self.write, ConsumerToBroker::Cancel).await?;
        while self.next_delivery().await?.is_some() {}
        Ok(())
    }
}
