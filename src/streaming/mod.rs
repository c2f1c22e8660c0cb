//! Reassembly of streamed response chunks.
//!
//! A session has at most one message in flight. Chunks carry a sequence
//! number; anything at or below the last applied sequence is a duplicate and
//! is dropped, so replays are harmless. Completed messages move to the
//! finalized list in completion order and are never reopened.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StreamingError;

/// A message being (or having been) streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingMessage {
    pub id: String,
    pub sequence_last_applied: u64,
    pub content_so_far: String,
    pub is_complete: bool,
}

impl StreamingMessage {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            sequence_last_applied: 0,
            content_so_far: String::new(),
            is_complete: false,
        }
    }
}

/// What happened to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Appended to the active message.
    Applied,
    /// Sequence already applied.
    Duplicate,
    /// The message was already finalized.
    Late,
}

impl ChunkOutcome {
    /// Only applied chunks are forwarded to subscribers.
    pub fn is_applied(&self) -> bool {
        matches!(self, ChunkOutcome::Applied)
    }
}

/// Per-session chunk assembler.
#[derive(Debug, Clone, Default)]
pub struct StreamingResponseAssembler {
    active: Option<StreamingMessage>,
    finalized: Vec<StreamingMessage>,
}

impl StreamingResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk.
    ///
    /// A chunk for a new id while another message is still active is a
    /// protocol error.
    pub fn apply_chunk(
        &mut self,
        message_id: &str,
        sequence: u64,
        content: &str,
    ) -> Result<ChunkOutcome, StreamingError> {
        if self.is_finalized(message_id) {
            debug!(message_id, sequence, "Discarding late chunk for finalized message");
            return Ok(ChunkOutcome::Late);
        }

        if let Some(active) = &self.active {
            if active.id != message_id {
                let err = StreamingError::ConcurrentMessage {
                    active: active.id.clone(),
                    incoming: message_id.to_string(),
                };
                warn!(error = %err, "Streaming protocol error");
                return Err(err);
            }
        }

        let message = self
            .active
            .get_or_insert_with(|| StreamingMessage::new(message_id));

        if sequence <= message.sequence_last_applied {
            debug!(
                message_id,
                sequence,
                last_applied = message.sequence_last_applied,
                "Discarding duplicate chunk"
            );
            return Ok(ChunkOutcome::Duplicate);
        }

        message.content_so_far.push_str(content);
        message.sequence_last_applied = sequence;
        Ok(ChunkOutcome::Applied)
    }

    /// Mark a message complete and move it to the finalized list.
    ///
    /// Returns `None` for a repeated completion marker.
    pub fn complete(&mut self, message_id: &str) -> Result<Option<StreamingMessage>, StreamingError> {
        if self.is_finalized(message_id) {
            return Ok(None);
        }

        match self.active.take() {
            Some(mut message) if message.id == message_id => {
                message.is_complete = true;
                debug!(
                    message_id,
                    length = message.content_so_far.len(),
                    "Streaming message finalized"
                );
                self.finalized.push(message.clone());
                Ok(Some(message))
            }
            other => {
                self.active = other;
                Err(StreamingError::UnknownMessage {
                    message_id: message_id.to_string(),
                })
            }
        }
    }

    /// Message currently being streamed.
    pub fn active(&self) -> Option<&StreamingMessage> {
        self.active.as_ref()
    }

    /// Finalized messages in completion order.
    pub fn finalized(&self) -> &[StreamingMessage] {
        &self.finalized
    }

    fn is_finalized(&self, message_id: &str) -> bool {
        self.finalized.iter().any(|m| m.id == message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_sequence_is_ignored() {
        let mut assembler = StreamingResponseAssembler::new();
        let outcomes: Vec<ChunkOutcome> = [(1, "a"), (2, "b"), (2, "b"), (3, "c")]
            .iter()
            .map(|(seq, text)| assembler.apply_chunk("m1", *seq, text).unwrap())
            .collect();

        assert_eq!(
            outcomes,
            vec![
                ChunkOutcome::Applied,
                ChunkOutcome::Applied,
                ChunkOutcome::Duplicate,
                ChunkOutcome::Applied,
            ]
        );
        let active = assembler.active().unwrap();
        assert_eq!(active.content_so_far, "abc");
        assert_eq!(active.sequence_last_applied, 3);
    }

    #[test]
    fn test_out_of_order_old_chunk_is_discarded() {
        let mut assembler = StreamingResponseAssembler::new();
        assembler.apply_chunk("m1", 2, "b").unwrap();
        assert_eq!(
            assembler.apply_chunk("m1", 1, "a").unwrap(),
            ChunkOutcome::Duplicate
        );
        assert_eq!(assembler.active().unwrap().content_so_far, "b");
    }

    #[test]
    fn test_complete_moves_to_finalized() {
        let mut assembler = StreamingResponseAssembler::new();
        assembler.apply_chunk("m1", 1, "hello ").unwrap();
        assembler.apply_chunk("m1", 2, "world").unwrap();

        let message = assembler.complete("m1").unwrap().unwrap();
        assert!(message.is_complete);
        assert_eq!(message.content_so_far, "hello world");
        assert!(assembler.active().is_none());
        assert_eq!(assembler.finalized().len(), 1);

        // Repeated marker is a no-op.
        assert!(assembler.complete("m1").unwrap().is_none());
        assert_eq!(assembler.finalized().len(), 1);
    }

    #[test]
    fn test_late_chunk_after_completion() {
        let mut assembler = StreamingResponseAssembler::new();
        assembler.apply_chunk("m1", 1, "done").unwrap();
        assembler.complete("m1").unwrap();

        assert_eq!(
            assembler.apply_chunk("m1", 2, "late").unwrap(),
            ChunkOutcome::Late
        );
        assert_eq!(assembler.finalized()[0].content_so_far, "done");
        assert!(assembler.active().is_none());
    }

    #[test]
    fn test_concurrent_message_is_protocol_error() {
        let mut assembler = StreamingResponseAssembler::new();
        assembler.apply_chunk("m1", 1, "a").unwrap();

        let err = assembler.apply_chunk("m2", 1, "x").unwrap_err();
        assert_eq!(
            err,
            StreamingError::ConcurrentMessage {
                active: "m1".to_string(),
                incoming: "m2".to_string(),
            }
        );
        assert_eq!(assembler.active().unwrap().id, "m1");
    }

    #[test]
    fn test_complete_unknown_message() {
        let mut assembler = StreamingResponseAssembler::new();
        assembler.apply_chunk("m1", 1, "a").unwrap();

        let err = assembler.complete("m9").unwrap_err();
        assert!(matches!(err, StreamingError::UnknownMessage { .. }));
        assert_eq!(assembler.active().unwrap().id, "m1");
    }

    #[test]
    fn test_finalized_in_completion_order() {
        let mut assembler = StreamingResponseAssembler::new();
        for id in ["first", "second", "third"] {
            assembler.apply_chunk(id, 1, id).unwrap();
            assembler.complete(id).unwrap();
        }
        let ids: Vec<&str> = assembler.finalized().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }
}
