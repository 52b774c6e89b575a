//! The dispatcher is the heart of the broker. All queue state lives here,
//! and it runs on a task of its own, fed by a channel. Sending and
//! journaling are behind [`DispatcherDeps`] so the state machine can be
//! driven directly in tests.

use anyhow::Result;
use corral_base::proto::{
    BrokerToConsumer, BrokerToPublisher, ConsumerToBroker, PublisherToBroker,
};
use slog::{info, warn, Logger};
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, derive_more::Display)]
pub struct PublisherId(pub u64);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, derive_more::Display)]
pub struct ConsumerId(pub u64);

/// The dispatcher's dependencies on the outside world. The production
/// implementation sends on unbounded channels and appends to the journal
/// set; tests record everything instead.
pub trait DispatcherDeps {
    type PublisherSender;
    type ConsumerSender;

    fn send_to_publisher(&mut self, sender: &mut Self::PublisherSender, message: BrokerToPublisher);
    fn send_to_consumer(&mut self, sender: &mut Self::ConsumerSender, message: BrokerToConsumer);

    /// Record a publish durably. A publish is acknowledged to the publisher
    /// only after this returns Ok.
    fn journal_publish(&mut self, queue: &str, body: &str) -> Result<()>;

    /// Record that a delivered message has been acked and must not be
    /// redelivered after a restart.
    fn journal_ack(&mut self, queue: &str, body: &str) -> Result<()>;
}

pub enum Message<DepsT: DispatcherDeps> {
    PublisherConnected(PublisherId, DepsT::PublisherSender),
    PublisherDisconnected(PublisherId),
    FromPublisher(PublisherId, PublisherToBroker),
    /// Consumer for the named queue, with the tag it introduced itself with.
    ConsumerConnected(ConsumerId, String, String, DepsT::ConsumerSender),
    ConsumerDisconnected(ConsumerId),
    FromConsumer(ConsumerId, ConsumerToBroker),
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<String>,
    /// Consumers with no un-acked delivery, in arrival order.
    waiting: VecDeque<ConsumerId>,
}

struct Consumer<SenderT> {
    queue: String,
    tag: String,
    sender: SenderT,
    /// The single outstanding delivery, if any. At most one per consumer:
    /// the next delivery is sent only once this one is acked.
    in_flight: Option<(u64, String)>,
    canceled: bool,
}

pub struct Dispatcher<DepsT: DispatcherDeps> {
    log: Logger,
    queues: HashMap<String, Queue>,
    publishers: HashMap<PublisherId, DepsT::PublisherSender>,
    consumers: HashMap<ConsumerId, Consumer<DepsT::ConsumerSender>>,
    next_delivery_id: u64,
}

impl<DepsT: DispatcherDeps> Dispatcher<DepsT> {
    /// `initial` holds the bodies recovered from the journals at startup,
    /// per queue, in publish order.
    pub fn new(log: Logger, initial: HashMap<String, VecDeque<String>>) -> Self {
        let queues = initial
            .into_iter()
            .map(|(name, ready)| {
                (
                    name,
                    Queue {
                        ready,
                        waiting: VecDeque::new(),
                    },
                )
            })
            .collect();
        Self {
            log,
            queues,
            publishers: HashMap::new(),
            consumers: HashMap::new(),
            next_delivery_id: 1,
        }
    }

    pub fn receive_message(&mut self, deps: &mut DepsT, msg: Message<DepsT>) {
        match msg {
            Message::PublisherConnected(id, sender) => {
                self.publishers.insert(id, sender);
            }
            Message::PublisherDisconnected(id) => {
                self.publishers.remove(&id);
            }
            Message::FromPublisher(id, PublisherToBroker::Publish { queue, body }) => {
                self.receive_publish(deps, id, queue, body);
            }
            Message::ConsumerConnected(id, queue, tag, sender) => {
                info!(self.log, "consumer connected";
                    "id" => %id, "queue" => &queue, "tag" => &tag);
                self.consumers.insert(
                    id,
                    Consumer {
                        queue: queue.clone(),
                        tag,
                        sender,
                        in_flight: None,
                        canceled: false,
                    },
                );
                self.queues.entry(queue.clone()).or_default().waiting.push_back(id);
                self.dispatch_next(deps, &queue);
            }
            Message::ConsumerDisconnected(id) => {
                self.receive_consumer_disconnected(deps, id);
            }
            Message::FromConsumer(id, ConsumerToBroker::Ack { delivery_id }) => {
                self.receive_ack(deps, id, delivery_id);
            }
            Message::FromConsumer(id, ConsumerToBroker::Cancel) => {
                self.receive_cancel(deps, id);
            }
        }
    }

    fn receive_publish(&mut self, deps: &mut DepsT, id: PublisherId, queue: String, body: String) {
        let reply = match deps.journal_publish(&queue, &body) {
            Ok(()) => {
                self.queues.entry(queue.clone()).or_default().ready.push_back(body);
                BrokerToPublisher::Published
            }
            Err(err) => {
                warn!(self.log, "publish rejected";
                    "queue" => &queue, "error" => %err);
                BrokerToPublisher::Rejected(err.to_string())
            }
        };
        let accepted = reply == BrokerToPublisher::Published;
        if let Some(sender) = self.publishers.get_mut(&id) {
            deps.send_to_publisher(sender, reply);
        }
        if accepted {
            self.dispatch_next(deps, &queue);
        }
    }

    fn receive_ack(&mut self, deps: &mut DepsT, id: ConsumerId, delivery_id: u64) {
        let Some(consumer) = self.consumers.get_mut(&id) else {
            return;
        };
        match consumer.in_flight.take() {
            Some((expected, body)) if expected == delivery_id => {
                if let Err(err) = deps.journal_ack(&consumer.queue, &body) {
                    // The message stays journaled and will be redelivered
                    // after a restart. At-least-once allows that.
                    warn!(self.log, "error journaling ack";
                        "queue" => &consumer.queue, "body" => &body, "error" => %err);
                }
                let queue = consumer.queue.clone();
                if !consumer.canceled {
                    self.queues.entry(queue.clone()).or_default().waiting.push_back(id);
                }
                self.dispatch_next(deps, &queue);
            }
            other => {
                warn!(self.log, "unexpected ack";
                    "id" => %id, "delivery_id" => delivery_id, "tag" => &consumer.tag);
                consumer.in_flight = other;
            }
        }
    }

    fn receive_cancel(&mut self, deps: &mut DepsT, id: ConsumerId) {
        let Some(consumer) = self.consumers.get_mut(&id) else {
            return;
        };
        consumer.canceled = true;
        deps.send_to_consumer(&mut consumer.sender, BrokerToConsumer::Canceled);
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            queue.waiting.retain(|waiting| *waiting != id);
        }
    }

    fn receive_consumer_disconnected(&mut self, deps: &mut DepsT, id: ConsumerId) {
        let Some(consumer) = self.consumers.remove(&id) else {
            return;
        };
        let queue = self.queues.entry(consumer.queue.clone()).or_default();
        queue.waiting.retain(|waiting| *waiting != id);
        if let Some((_, body)) = consumer.in_flight {
            // The consumer died mid-job. Put the message back at the front
            // so the next worker picks it up before newer jobs.
            warn!(self.log, "consumer disconnected with an un-acked delivery; requeueing";
                "queue" => &consumer.queue, "body" => &body, "tag" => &consumer.tag);
            queue.ready.push_front(body);
        }
        self.dispatch_next(deps, &consumer.queue);
    }

    fn dispatch_next(&mut self, deps: &mut DepsT, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() {
                return;
            }
            let Some(id) = queue.waiting.pop_front() else {
                return;
            };
            let Some(consumer) = self.consumers.get_mut(&id) else {
                continue;
            };
            if consumer.canceled || consumer.in_flight.is_some() {
                continue;
            }
            let Some(body) = queue.ready.pop_front() else {
                return;
            };
            let delivery_id = self.next_delivery_id;
            self.next_delivery_id += 1;
            consumer.in_flight = Some((delivery_id, body.clone()));
            deps.send_to_consumer(
                &mut consumer.sender,
                BrokerToConsumer::Delivery { delivery_id, body },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use assert_matches::assert_matches;
    use slog::o;
    use std::{cell::RefCell, rc::Rc};

    type Sent<MessageT> = Rc<RefCell<Vec<MessageT>>>;

    #[derive(Default)]
    struct TestDeps {
        journal: Vec<String>,
        fail_publish: bool,
    }

    impl DispatcherDeps for TestDeps {
        type PublisherSender = Sent<BrokerToPublisher>;
        type ConsumerSender = Sent<BrokerToConsumer>;

        fn send_to_publisher(
            &mut self,
            sender: &mut Self::PublisherSender,
            message: BrokerToPublisher,
        ) {
            sender.borrow_mut().push(message);
        }

        fn send_to_consumer(
            &mut self,
            sender: &mut Self::ConsumerSender,
            message: BrokerToConsumer,
        ) {
            sender.borrow_mut().push(message);
        }

        fn journal_publish(&mut self, queue: &str, body: &str) -> Result<()> {
            if self.fail_publish {
                return Err(anyhow!("disk full"));
            }
            self.journal.push(format!("+ {queue} {body}"));
            Ok(())
        }

        fn journal_ack(&mut self, queue: &str, body: &str) -> Result<()> {
            self.journal.push(format!("- {queue} {body}"));
            Ok(())
        }
    }

    struct Fixture {
        deps: TestDeps,
        dispatcher: Dispatcher<TestDeps>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_initial(HashMap::new())
        }

        fn with_initial(initial: HashMap<String, VecDeque<String>>) -> Self {
            Self {
                deps: TestDeps::default(),
                dispatcher: Dispatcher::new(Logger::root(slog::Discard, o!()), initial),
            }
        }

        fn connect_publisher(&mut self, id: u64) -> Sent<BrokerToPublisher> {
            let sent = Sent::default();
            self.dispatcher.receive_message(
                &mut self.deps,
                Message::PublisherConnected(PublisherId(id), sent.clone()),
            );
            sent
        }

        fn connect_consumer(&mut self, id: u64, queue: &str) -> Sent<BrokerToConsumer> {
            let sent = Sent::default();
            self.dispatcher.receive_message(
                &mut self.deps,
                Message::ConsumerConnected(
                    ConsumerId(id),
                    queue.to_string(),
                    format!("pid-{id}"),
                    sent.clone(),
                ),
            );
            sent
        }

        fn publish(&mut self, id: u64, queue: &str, body: &str) {
            self.dispatcher.receive_message(
                &mut self.deps,
                Message::FromPublisher(
                    PublisherId(id),
                    PublisherToBroker::Publish {
                        queue: queue.to_string(),
                        body: body.to_string(),
                    },
                ),
            );
        }

        fn ack(&mut self, id: u64, delivery_id: u64) {
            self.dispatcher.receive_message(
                &mut self.deps,
                Message::FromConsumer(ConsumerId(id), ConsumerToBroker::Ack { delivery_id }),
            );
        }
    }

    #[test]
    fn publish_is_confirmed_and_delivered_to_a_waiting_consumer() {
        let mut fixture = Fixture::new();
        let consumer = fixture.connect_consumer(1, "md5");
        let publisher = fixture.connect_publisher(2);
        fixture.publish(2, "md5", "17");

        assert_eq!(publisher.borrow().as_slice(), [BrokerToPublisher::Published]);
        assert_matches!(
            consumer.borrow().as_slice(),
            [BrokerToConsumer::Delivery { body, .. }] if body == "17"
        );
        assert_eq!(fixture.deps.journal, ["+ md5 17"]);
    }

    #[test]
    fn at_most_one_delivery_is_outstanding_per_consumer() {
        let mut fixture = Fixture::new();
        fixture.connect_publisher(1);
        fixture.publish(1, "md5", "1");
        fixture.publish(1, "md5", "2");
        let consumer = fixture.connect_consumer(2, "md5");

        assert_eq!(consumer.borrow().len(), 1);
        let first_id = assert_matches!(
            &consumer.borrow()[0],
            BrokerToConsumer::Delivery { delivery_id, body } if body == "1" => *delivery_id
        );

        fixture.ack(2, first_id);
        assert_eq!(consumer.borrow().len(), 2);
        assert_matches!(
            &consumer.borrow()[1],
            BrokerToConsumer::Delivery { body, .. } if body == "2"
        );
        assert_eq!(fixture.deps.journal, ["+ md5 1", "+ md5 2", "- md5 1"]);
    }

    #[test]
    fn two_consumers_split_the_queue() {
        let mut fixture = Fixture::new();
        let first = fixture.connect_consumer(1, "md5");
        let second = fixture.connect_consumer(2, "md5");
        fixture.connect_publisher(3);
        fixture.publish(3, "md5", "1");
        fixture.publish(3, "md5", "2");

        assert_eq!(first.borrow().len(), 1);
        assert_eq!(second.borrow().len(), 1);
    }

    #[test]
    fn disconnect_without_ack_requeues_at_the_front() {
        let mut fixture = Fixture::new();
        fixture.connect_publisher(1);
        fixture.publish(1, "md5", "1");
        fixture.publish(1, "md5", "2");
        let doomed = fixture.connect_consumer(2, "md5");
        assert_matches!(
            &doomed.borrow()[0],
            BrokerToConsumer::Delivery { body, .. } if body == "1"
        );

        fixture
            .dispatcher
            .receive_message(&mut fixture.deps, Message::ConsumerDisconnected(ConsumerId(2)));

        // The replacement sees the dropped job first.
        let replacement = fixture.connect_consumer(3, "md5");
        assert_matches!(
            &replacement.borrow()[0],
            BrokerToConsumer::Delivery { body, .. } if body == "1"
        );
    }

    #[test]
    fn cancel_answers_canceled_and_stops_deliveries() {
        let mut fixture = Fixture::new();
        let consumer = fixture.connect_consumer(1, "md5");
        fixture
            .dispatcher
            .receive_message(&mut fixture.deps, Message::FromConsumer(ConsumerId(1), ConsumerToBroker::Cancel));
        assert_eq!(consumer.borrow().as_slice(), [BrokerToConsumer::Canceled]);

        fixture.connect_publisher(2);
        fixture.publish(2, "md5", "1");
        assert_eq!(consumer.borrow().len(), 1);
    }

    #[test]
    fn journal_failure_rejects_the_publish() {
        let mut fixture = Fixture::new();
        fixture.deps.fail_publish = true;
        let consumer = fixture.connect_consumer(1, "md5");
        let publisher = fixture.connect_publisher(2);
        fixture.publish(2, "md5", "1");

        assert_matches!(
            &publisher.borrow()[0],
            BrokerToPublisher::Rejected(reason) if reason.contains("disk full")
        );
        assert!(consumer.borrow().is_empty());
    }

    #[test]
    fn recovered_messages_are_delivered_to_the_first_consumer() {
        let initial = HashMap::from([(
            "md5".to_string(),
            VecDeque::from(["4".to_string(), "5".to_string()]),
        )]);
        let mut fixture = Fixture::with_initial(initial);
        let consumer = fixture.connect_consumer(1, "md5");
        let first_id = assert_matches!(
            &consumer.borrow()[0],
            BrokerToConsumer::Delivery { delivery_id, body } if body == "4" => *delivery_id
        );
        fixture.ack(1, first_id);
        assert_matches!(
            &consumer.borrow()[1],
            BrokerToConsumer::Delivery { body, .. } if body == "5"
        );
    }

    #[test]
    fn ack_with_the_wrong_delivery_id_changes_nothing() {
        let mut fixture = Fixture::new();
        fixture.connect_publisher(1);
        fixture.publish(1, "md5", "1");
        let consumer = fixture.connect_consumer(2, "md5");
        fixture.ack(2, 999);
        assert_eq!(consumer.borrow().len(), 1);
        assert!(!fixture.deps.journal.iter().any(|l| l.starts_with('-')));
    }
}
