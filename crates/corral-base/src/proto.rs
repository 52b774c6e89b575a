//! Messages sent between the broker and its peers.
//!
//! Queue bodies are strings: the decimal form of a [`crate::JobId`]. Nothing
//! else rides the bus; workers fetch payload bytes from the front-end over
//! HTTP.

use serde::{Deserialize, Serialize};

/// The first message sent by a connector to the broker. It identifies what
/// the connector is and, for consumers, which queue it wants.
#[derive(Serialize, Deserialize, Debug)]
pub enum Hello {
    /// The front-end. Sends [`PublisherToBroker`] messages and reads
    /// [`BrokerToPublisher`] replies.
    Publisher,

    /// A worker. Receives deliveries one at a time from `queue` and
    /// acknowledges each after it has finished handling it. `tag` names the
    /// consumer in broker logs (workers use `pid-<os_pid>`).
    Consumer { queue: String, tag: String },
}

/// Message sent from a publisher to the broker. Each is answered with a
/// [`BrokerToPublisher`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum PublisherToBroker {
    /// Enqueue `body` on the durable queue named `queue`, creating the queue
    /// if this is the first time the name is seen.
    Publish { queue: String, body: String },
}

/// Reply sent from the broker to a publisher.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum BrokerToPublisher {
    /// The message is journaled to disk and will survive a broker restart.
    Published,

    /// The message was not enqueued. The string describes why.
    Rejected(String),
}

/// Message sent from a consumer to the broker after the initial [`Hello`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum ConsumerToBroker {
    /// The consumer has finished handling the identified delivery, whether
    /// the job succeeded or not. The broker forgets the message and may send
    /// the next one.
    Ack { delivery_id: u64 },

    /// Stop the subscription. Answered with [`BrokerToConsumer::Canceled`].
    Cancel,
}

/// Message sent from the broker to a consumer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum BrokerToConsumer {
    /// One queued message. The broker sends at most one un-acked delivery
    /// per consumer; the next arrives only after [`ConsumerToBroker::Ack`].
    Delivery { delivery_id: u64, body: String },

    /// The subscription has ended; no further deliveries will arrive.
    Canceled,
}
