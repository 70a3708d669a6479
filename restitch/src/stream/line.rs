// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Line tokenizer
//
// Turns an upstream byte stream into a bounded channel of SSE lines. The
// producer task runs independently of the engine loop so upstream bytes
// drain without blocking on downstream flushes; the channel capacity gives
// back-pressure. A read error simply ends the sequence; the engine
// observes the missing finish reason and classifies the attempt as a drop.

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::upstream::ByteStream;

use super::types::LINE_CHANNEL_CAPACITY;

/// Spawn the tokenizer task for one upstream body.
///
/// Each received item is one logical SSE line with its terminator removed
/// (`\n`, or `\r\n`). Blank separator lines are delivered as empty strings.
/// The channel closes when the body ends or errors.
pub fn spawn_line_reader(mut body: ByteStream) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::debug!(%err, "upstream body ended with read error");
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let mut line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                line_bytes.pop();
                if line_bytes.last() == Some(&b'\r') {
                    line_bytes.pop();
                }
                let line = String::from_utf8_lossy(&line_bytes).into_owned();
                if tx.send(line).await.is_err() {
                    return;
                }
            }
        }

        // A trailing fragment without a terminator is still a line.
        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).into_owned();
            let _ = tx.send(line.trim_end_matches('\r').to_string()).await;
        }
    });

    rx
}
