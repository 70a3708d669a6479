// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Streaming retry pipeline
//
// Responsibilities:
// - Tokenize upstream bytes into SSE lines on a bounded channel
// - Classify each line: text, thought, finish reason, blocked
// - Decide in real time between legitimate completion and interruption
// - On interruption, splice a continuation stream into the live response
// - Hide post-retry thought chunks until formal text resumes

mod classifier;
mod line;
mod session;
mod types;
mod writer;

pub use classifier::{classify, is_clean_finish, is_data_line, strip_done_token};
pub use line::spawn_line_reader;
pub use session::{Session, SessionError};
pub use types::{ClassifiedLine, InterruptionReason, DONE_LINE, DONE_TOKEN, LINE_CHANNEL_CAPACITY};
pub use writer::{ClientGone, DownstreamWriter};
