//! The writer loop: the single task permitted to write to the transport for
//! a given connection generation. Frames leave in exactly the order their
//! submissions finished encoding — no reordering, no locking on the write
//! side.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::SinkExt;
use tokio::io::WriteHalf;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::codec::FramedWrite;
use tracing::warn;

use crate::framer::Framer;
use crate::transport::BoxedTransport;

pub enum WriterCommand {
    Frame(Bytes),
    /// Flush everything queued ahead of it, close the write half, then
    /// signal the given sender so the caller knows the drain is done.
    Shutdown(oneshot::Sender<()>),
}

pub async fn run(
    mut rx: mpsc::Receiver<WriterCommand>,
    mut sink: FramedWrite<WriteHalf<BoxedTransport>, Framer>,
    failed: Arc<Notify>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Frame(payload) => {
                if let Err(error) = sink.send(payload).await {
                    warn!(%error, "writer loop: transport write failed");
                    failed.notify_waiters();
                    return;
                }
            }
            WriterCommand::Shutdown(ack) => {
                let _ = sink.close().await;
                let _ = ack.send(());
                return;
            }
        }
    }
}
