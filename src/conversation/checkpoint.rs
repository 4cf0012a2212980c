//! Persistence boundary: turn a conversation and its budget into an opaque blob and back.
//!
//! The encoding is pluggable through [`CheckpointCodec`]; [`JsonCodec`] is the
//! default used by [`serialize`] and [`restore`].

use serde::{Deserialize, Serialize};

use super::ConversationState;
use crate::budget::Budget;
use crate::error::ConductorError;
use crate::types::Turn;

/// Serializable capture of a loop's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub version: u32,
    pub turns: Vec<Turn>,
    pub budget: Budget,
}

impl Checkpoint {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn capture(state: &ConversationState, budget: &Budget) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            turns: state.turns().to_vec(),
            budget: *budget,
        }
    }

    /// Rebuild the conversation, re-checking every pairing rule.
    pub fn into_parts(self) -> Result<(ConversationState, Budget), ConductorError> {
        if self.version != Self::CURRENT_VERSION {
            return Err(ConductorError::InvalidArgument(format!(
                "unsupported checkpoint version {} (expected {})",
                self.version,
                Self::CURRENT_VERSION
            )));
        }
        let state = ConversationState::from_turns(self.turns)?;
        Ok((state, self.budget))
    }
}

/// Wire format for checkpoints, owned by the caller.
pub trait CheckpointCodec: Send + Sync {
    fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>, ConductorError>;
    fn decode(&self, blob: &[u8]) -> Result<Checkpoint, ConductorError>;
}

/// JSON checkpoint encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl CheckpointCodec for JsonCodec {
    fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>, ConductorError> {
        Ok(serde_json::to_vec(checkpoint)?)
    }

    fn decode(&self, blob: &[u8]) -> Result<Checkpoint, ConductorError> {
        Ok(serde_json::from_slice(blob)?)
    }
}

/// Encode a conversation and budget with the default codec.
pub fn serialize(state: &ConversationState, budget: &Budget) -> Result<Vec<u8>, ConductorError> {
    JsonCodec.encode(&Checkpoint::capture(state, budget))
}

/// Decode a blob produced by [`serialize`].
pub fn restore(blob: &[u8]) -> Result<(ConversationState, Budget), ConductorError> {
    JsonCodec.decode(blob)?.into_parts()
}
