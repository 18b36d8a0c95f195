// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
mod compress;
mod context;
mod error;
mod events;
mod loop_detect;
mod runtime;

pub use compress::{CompressionOutcome, CompressionRequest, Compressor};
pub use context::{
    ContextEntry, ContextManager, HeuristicTokenizer, Snapshot, Tokenizer, Trigger,
};
pub use error::CoreError;
pub use events::Notification;
pub use loop_detect::{LoopDetector, LoopKind, LoopPattern};
pub use runtime::ConversationRuntime;
