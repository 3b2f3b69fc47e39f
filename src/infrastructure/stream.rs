//! In-process client streams backed by tokio channels.
//!
//! The CLI and the tests talk to the orchestration services through these;
//! a network transport would implement the same two ports.

use crate::domain::ports::{MessageSink, MessageSource};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Reading half of a client stream. The client may push decode failures as
/// `Err` items; dropping every sender ends the stream cleanly.
pub struct StreamReader<T> {
    rx: mpsc::Receiver<Result<T>>,
}

/// Writing half of a client stream. Fails once the client hung up.
pub struct StreamWriter<T> {
    tx: mpsc::Sender<T>,
}

/// A stream the client writes into.
pub fn inbound<T>(buffer: usize) -> (mpsc::Sender<Result<T>>, StreamReader<T>) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, StreamReader { rx })
}

/// A stream the client reads from.
pub fn outbound<T>(buffer: usize) -> (StreamWriter<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(buffer);
    (StreamWriter { tx }, rx)
}

#[async_trait]
impl<T: Send + 'static> MessageSource<T> for StreamReader<T> {
    async fn recv(&mut self) -> Result<Option<T>> {
        self.rx.recv().await.transpose()
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSink<T> for StreamWriter<T> {
    async fn send(&mut self, item: T) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| RpcError::StreamError("client stream closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_surfaces_items_errors_and_end() {
        let (tx, mut reader) = inbound::<u32>(4);
        tx.send(Ok(1)).await.unwrap();
        tx.send(Err(RpcError::StreamError("bad frame".into())))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(reader.recv().await.unwrap(), Some(1));
        assert!(reader.recv().await.is_err());
        assert_eq!(reader.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writer_fails_after_hangup() {
        let (mut writer, rx) = outbound::<u32>(1);
        drop(rx);
        assert!(matches!(
            writer.send(7).await,
            Err(RpcError::StreamError(_))
        ));
    }
}
