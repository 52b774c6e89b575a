//! Code for the broker binary.
//!
//! The broker owns one durable queue per engine. The front-end publishes
//! job ids; workers consume them one at a time and acknowledge each after
//! the job has been disposed of, whatever the outcome.

pub mod config;
mod dispatcher;
mod journal;

use anyhow::Result;
use corral_base::proto::{BrokerToConsumer, BrokerToPublisher, Hello};
use corral_util::{net, process::signal_handler};
use dispatcher::{ConsumerId, Dispatcher, DispatcherDeps, Message, PublisherId};
use journal::JournalSet;
use slog::{debug, error, info, Logger};
use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
};
use tokio::{
    net::TcpListener,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinSet,
};

struct BrokerDeps {
    journals: JournalSet,
}

/// The production implementation of [`DispatcherDeps`]: messages go out on
/// the per-socket channels and durability goes through the journal set.
impl DispatcherDeps for BrokerDeps {
    type PublisherSender = UnboundedSender<BrokerToPublisher>;
    type ConsumerSender = UnboundedSender<BrokerToConsumer>;

    fn send_to_publisher(
        &mut self,
        sender: &mut Self::PublisherSender,
        message: BrokerToPublisher,
    ) {
        sender.send(message).ok();
    }

    fn send_to_consumer(&mut self, sender: &mut Self::ConsumerSender, message: BrokerToConsumer) {
        sender.send(message).ok();
    }

    fn journal_publish(&mut self, queue: &str, body: &str) -> Result<()> {
        self.journals.record_publish(queue, body)
    }

    fn journal_ack(&mut self, queue: &str, body: &str) -> Result<()> {
        self.journals.record_ack(queue, body)
    }
}

type DispatcherMessage = Message<BrokerDeps>;

/// Main loop for the dispatcher. There is exactly one of these per broker
/// process. Returns when all senders associated with the receiver have
/// closed, which happens when the listener and every socket task are gone.
async fn dispatcher_main(
    receiver: UnboundedReceiver<DispatcherMessage>,
    journals: JournalSet,
    initial: HashMap<String, VecDeque<String>>,
    log: Logger,
) -> Result<()> {
    let mut deps = BrokerDeps { journals };
    let mut dispatcher = Dispatcher::new(log, initial);
    net::channel_reader(receiver, |msg| dispatcher.receive_message(&mut deps, msg)).await;
    Ok(())
}

/// Main loop for one publisher or consumer socket. Registers with the
/// dispatcher, plumbs the socket to and from it with a reader/writer task
/// pair, and deregisters when either side of the socket goes away. The
/// disconnected message is sent only after both tasks are done so that all
/// messages read from the socket reach the dispatcher first.
async fn socket_main<IdT, FromDispatcherT, ReaderFutureT, WriterFutureT>(
    dispatcher_sender: UnboundedSender<DispatcherMessage>,
    id: IdT,
    connected_msg_builder: impl FnOnce(IdT, UnboundedSender<FromDispatcherT>) -> DispatcherMessage,
    disconnected_msg_builder: impl FnOnce(IdT) -> DispatcherMessage,
    socket_reader_main: impl FnOnce(UnboundedSender<DispatcherMessage>) -> ReaderFutureT,
    socket_writer_main: impl FnOnce(UnboundedReceiver<FromDispatcherT>) -> WriterFutureT,
) where
    IdT: Copy + Send + 'static,
    FromDispatcherT: Send + 'static,
    ReaderFutureT: std::future::Future<Output = Result<()>> + Send + 'static,
    WriterFutureT: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let (socket_sender, socket_receiver) = mpsc::unbounded_channel();

    if dispatcher_sender
        .send(connected_msg_builder(id, socket_sender))
        .is_err()
    {
        // The dispatcher has quit, so we should too.
        return;
    }

    let mut join_set = JoinSet::new();
    join_set.spawn(socket_reader_main(dispatcher_sender.clone()));
    join_set.spawn(socket_writer_main(socket_receiver));

    // Wait for one side to finish, then cancel the other and wait for it.
    join_set.join_next().await;
    join_set.shutdown().await;

    dispatcher_sender.send(disconnected_msg_builder(id)).ok();
}

/// Main loop for the listener. Accepts connections, reads the [`Hello`],
/// and spawns a socket task pair for each peer.
async fn listener_main(
    listener: TcpListener,
    dispatcher_sender: UnboundedSender<DispatcherMessage>,
    log: Logger,
) -> Result<()> {
    let mut id = 0u64;

    loop {
        let (mut socket, peer_addr) = listener.accept().await?;
        let dispatcher_sender = dispatcher_sender.clone();
        let log = log.clone();

        tokio::task::spawn(async move {
            socket.set_nodelay(true).ok();
            let hello: Hello = net::read_message_from_async_socket(&mut socket).await?;
            debug!(log, "connected"; "hello" => ?hello, "peer" => %peer_addr, "id" => id);
            let (read_stream, write_stream) = socket.into_split();
            let read_stream = tokio::io::BufReader::new(read_stream);
            match hello {
                Hello::Publisher => {
                    let id = PublisherId(id);
                    socket_main(
                        dispatcher_sender,
                        id,
                        Message::PublisherConnected,
                        Message::PublisherDisconnected,
                        |dispatcher_sender| {
                            net::socket_reader(read_stream, dispatcher_sender, move |msg| {
                                Message::FromPublisher(id, msg)
                            })
                        },
                        |dispatcher_receiver| net::socket_writer(dispatcher_receiver, write_stream),
                    )
                    .await
                }
                Hello::Consumer { queue, tag } => {
                    let id = ConsumerId(id);
                    socket_main(
                        dispatcher_sender,
                        id,
                        |id, sender| Message::ConsumerConnected(id, queue, tag, sender),
                        Message::ConsumerDisconnected,
                        |dispatcher_sender| {
                            net::socket_reader(read_stream, dispatcher_sender, move |msg| {
                                Message::FromConsumer(id, msg)
                            })
                        },
                        |dispatcher_receiver| net::socket_writer(dispatcher_receiver, write_stream),
                    )
                    .await
                }
            }
            debug!(log, "disconnected"; "peer" => %peer_addr, "id" => id);
            Ok::<(), anyhow::Error>(())
        });

        id = id.wrapping_add(1);
    }
}

/// The main function for the broker. Returns on the first signal, if the
/// listener socket fails at accept time, or if journal recovery fails.
pub async fn main(listener: TcpListener, state_dir: PathBuf, log: Logger) -> Result<()> {
    let (journals, initial) = JournalSet::open(state_dir)?;
    for (queue, bodies) in &initial {
        if !bodies.is_empty() {
            info!(log, "recovered queued messages from journal";
                "queue" => queue, "count" => bodies.len());
        }
    }

    let (dispatcher_sender, dispatcher_receiver) = mpsc::unbounded_channel();

    let mut join_set = JoinSet::new();
    join_set.spawn(dispatcher_main(
        dispatcher_receiver,
        journals,
        initial,
        log.clone(),
    ));
    join_set.spawn(listener_main(listener, dispatcher_sender, log.clone()));
    join_set.spawn(signal_handler(tokio::signal::unix::SignalKind::interrupt()));
    join_set.spawn(signal_handler(tokio::signal::unix::SignalKind::terminate()));

    // The first task to finish takes the broker down: normally that is a
    // signal handler returning Ok.
    let result = join_set
        .join_next()
        .await
        .expect("join_set is not empty")
        .expect("no task should panic or be canceled");
    if let Err(err) = &result {
        error!(log, "broker task failed"; "error" => %err);
    }
    result
}
