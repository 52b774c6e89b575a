//! Functions for reading and writing protocol messages on sockets, and for
//! plumbing them to and from channels. Messages are bincode-encoded with a
//! u32 little-endian length prefix.

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
};

/// Write a single message to a socket-like object.
pub async fn write_message_to_async_socket(
    stream: &mut (impl AsyncWrite + Unpin),
    msg: impl Serialize,
) -> Result<()> {
    let buf = bincode::serialize(&msg)?;
    stream.write_u32_le(buf.len().try_into()?).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a single message from a socket-like object.
pub async fn read_message_from_async_socket<MessageT: DeserializeOwned>(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<MessageT> {
    let len = stream.read_u32_le().await?;
    let mut buf = vec![0; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

/// Loop reading messages from a socket and writing them to a channel,
/// transforming them along the way. Returns when the socket read fails,
/// which is how every socket connection eventually ends.
pub async fn socket_reader<MessageT, TransformedT>(
    mut socket: impl AsyncRead + Unpin,
    channel: UnboundedSender<TransformedT>,
    transform: impl Fn(MessageT) -> TransformedT,
) -> Result<()>
where
    MessageT: DeserializeOwned,
{
    loop {
        let msg = read_message_from_async_socket(&mut socket).await?;
        if channel.send(transform(msg)).is_err() {
            // The receiving task has gone away; there is nobody left to
            // hand messages to.
            return Ok(());
        }
    }
}

/// Loop reading messages from a channel and writing them to a socket.
/// Returns when the channel closes or the socket write fails.
pub async fn socket_writer<MessageT: Serialize>(
    mut channel: UnboundedReceiver<MessageT>,
    mut socket: impl AsyncWrite + Unpin,
) -> Result<()> {
    while let Some(msg) = channel.recv().await {
        write_message_to_async_socket(&mut socket, msg).await?;
    }
    Ok(())
}

/// Loop reading messages from a channel and handing them to a closure.
/// Returns when all senders associated with the channel have closed.
pub async fn channel_reader<MessageT>(
    mut channel: UnboundedReceiver<MessageT>,
    mut f: impl FnMut(MessageT),
) {
    while let Some(msg) = channel.recv().await {
        f(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::sync::mpsc;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    enum Ping {
        Hello { tag: String },
        Bye,
    }

    #[tokio::test]
    async fn messages_cross_a_duplex_stream_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message_to_async_socket(&mut a, Ping::Hello { tag: "pid-7".into() })
            .await
            .unwrap();
        write_message_to_async_socket(&mut a, Ping::Bye).await.unwrap();
        assert_eq!(
            read_message_from_async_socket::<Ping>(&mut b).await.unwrap(),
            Ping::Hello { tag: "pid-7".into() }
        );
        assert_eq!(
            read_message_from_async_socket::<Ping>(&mut b).await.unwrap(),
            Ping::Bye
        );
    }

    #[tokio::test]
    async fn socket_reader_transforms_and_forwards_until_eof() {
        let (mut a, b) = tokio::io::duplex(1024);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let reader = tokio::task::spawn(socket_reader(b, sender, |msg: Ping| (0u8, msg)));

        write_message_to_async_socket(&mut a, Ping::Bye).await.unwrap();
        drop(a);

        assert_eq!(receiver.recv().await, Some((0u8, Ping::Bye)));
        assert_eq!(receiver.recv().await, None);
        // EOF surfaces as an error from the read side.
        assert!(reader.await.unwrap().is_err());
    }
}
