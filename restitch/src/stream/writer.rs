// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Downstream writer
//
// Wraps the response body channel behind write-and-flush semantics. Each
// send is immediately visible to the streaming response body, so writing a
// frame is the flush. The mutex serializes whole frames: a multi-line frame
// (an error event) is never interleaved with a concurrent write.

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

/// The downstream client has gone away; the response channel is closed.
#[derive(Debug, thiserror::Error)]
#[error("downstream client disconnected")]
pub struct ClientGone;

pub struct DownstreamWriter {
    tx: Mutex<mpsc::Sender<Bytes>>,
}

impl DownstreamWriter {
    /// Create a writer and the stream feeding the response body.
    pub fn channel(capacity: usize) -> (Self, ReceiverStream<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Mutex::new(tx) }, ReceiverStream::new(rx))
    }

    /// Write one SSE line followed by the event terminator.
    pub async fn write_line(&self, line: &str) -> Result<(), ClientGone> {
        self.send(Bytes::from(format!("{line}\n\n"))).await
    }

    /// Write a named event frame (`event:` + `data:` + terminator) as one
    /// unit.
    pub async fn write_event(&self, event: &str, data: &str) -> Result<(), ClientGone> {
        self.send(Bytes::from(format!("event: {event}\ndata: {data}\n\n")))
            .await
    }

    async fn send(&self, frame: Bytes) -> Result<(), ClientGone> {
        let tx = self.tx.lock().await;
        tx.send(frame).await.map_err(|_| ClientGone)
    }
}
