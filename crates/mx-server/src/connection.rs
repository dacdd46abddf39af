//! Per-connection reader and writer tasks.
//!
//! The reader only assembles frames and forwards them to the event loop; it
//! never touches server state. The writer drains the connection's channel
//! onto the socket. Both are aborted when the slot's handler is dropped.

use crate::event_handler::{InboundEvent, InboundKind};
use crate::protocol::read_frame;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

/// Frames buffered between a client's handler and its writer task.
pub const WRITER_QUEUE_DEPTH: usize = 64;

/// Read frames until the peer closes, a frame is malformed, or the loop goes
/// away.
pub(crate) async fn read_loop<R>(reader: R, slot: usize, generation: u64, events: mpsc::Sender<InboundEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    loop {
        let kind = match read_frame(&mut reader).await {
            Ok(Some(frame)) => InboundKind::Frame(frame),
            Ok(None) => InboundKind::Closed,
            Err(err) => InboundKind::Failed(err),
        };
        let last = !matches!(kind, InboundKind::Frame(_));
        let event = InboundEvent {
            slot,
            generation,
            kind,
        };
        if events.send(event).await.is_err() || last {
            break;
        }
    }
    debug!(slot, generation, "Reader finished");
}

/// Write every frame handed over by the handler, then close the write side.
pub(crate) async fn write_loop<W>(mut writer: W, mut frames: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(bytes) = frames.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            debug!(error = %err, "Write failed, dropping connection output");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, MessageType};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn reader_forwards_frames_then_close() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(read_loop(server, 3, 7, tx));

        let frame = Frame::request(MessageType::GetOption, 1, Bytes::from_static(&[0, 0, 0, 1]));
        client.write_all(&frame.encode()).await.unwrap();
        drop(client);

        let first = rx.recv().await.unwrap();
        assert_eq!((first.slot, first.generation), (3, 7));
        assert!(matches!(first.kind, InboundKind::Frame(f) if f == frame));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.kind, InboundKind::Closed));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reader_reports_garbage_and_stops() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(read_loop(server, 1, 1, tx));

        client.write_all(&[0xff; 32]).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, InboundKind::Failed(_)));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn writer_sends_in_order_and_closes() {
        let (server, mut client) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(write_loop(server, rx));
        tx.send(Bytes::from_static(b"ab")).await.unwrap();
        tx.send(Bytes::from_static(b"cd")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcd");
    }
}
