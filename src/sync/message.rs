use super::Operation;
use crate::awareness::AwarenessUpdate;
use crate::core::{OpId, SequenceOp, StateVector};
use serde::{Deserialize, Serialize};

/// Everything two replicas exchange over a peer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    StateVector { vector: StateVector },
    OperationBatch { ops: Vec<Operation> },
    Awareness(AwarenessUpdate),
}

impl SyncMessage {
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        serde_json::to_vec(self).map_err(|err| DecodeError::Malformed(err.to_string()))
    }

    /// Decodes and validates an inbound message.
    pub fn decode(bytes: &[u8], limits: &ValidationLimits) -> Result<Self, DecodeError> {
        if bytes.len() > limits.max_message_bytes {
            return Err(DecodeError::ResourceLimitExceeded {
                limit: limits.max_message_bytes,
                actual: bytes.len(),
            });
        }
        let message: SyncMessage =
            serde_json::from_slice(bytes).map_err(|err| DecodeError::Malformed(err.to_string()))?;
        match &message {
            SyncMessage::StateVector { .. } => {}
            SyncMessage::OperationBatch { ops } => validate_batch(ops, limits)?,
            SyncMessage::Awareness(update) => {
                if update.replica == 0 {
                    return Err(DecodeError::InvalidAwareness {
                        reason: "replica id cannot be zero".to_string(),
                    });
                }
            }
        }
        Ok(message)
    }

    /// Packs `ops` into as many `OperationBatch` messages as it takes to keep
    /// each one within `limits`. Order is preserved, and an empty input
    /// still yields one empty batch.
    pub fn batches(
        ops: Vec<Operation>,
        limits: &ValidationLimits,
    ) -> Result<Vec<Self>, DecodeError> {
        let max_ops = limits.max_ops_per_message.max(1);
        let envelope = SyncMessage::OperationBatch { ops: Vec::new() }.encode()?.len();

        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut size = envelope;
        for op in ops {
            let op_size = serde_json::to_vec(&op)
                .map_err(|err| DecodeError::Malformed(err.to_string()))?
                .len();
            // One byte for the separating comma.
            let grown = size + op_size + usize::from(!current.is_empty());
            let full = current.len() >= max_ops || grown > limits.max_message_bytes;
            if !current.is_empty() && full {
                batches.push(SyncMessage::OperationBatch {
                    ops: std::mem::take(&mut current),
                });
                size = envelope;
            }
            size += op_size + usize::from(!current.is_empty());
            current.push(op);
        }
        if !current.is_empty() || batches.is_empty() {
            batches.push(SyncMessage::OperationBatch { ops: current });
        }
        Ok(batches)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::StateVector { .. } => "state_vector",
            SyncMessage::OperationBatch { .. } => "operation_batch",
            SyncMessage::Awareness(_) => "awareness",
        }
    }
}

/// Validation errors for inbound wire messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Bytes are not a well-formed message
    #[error("malformed message: {0}")]
    Malformed(String),
    /// Operation data is structurally invalid
    #[error("malformed operation {op_id}: {reason}")]
    MalformedOperation { op_id: OpId, reason: String },
    /// Awareness payload is invalid
    #[error("invalid awareness update: {reason}")]
    InvalidAwareness { reason: String },
    /// Message exceeds configured resource limits
    #[error("resource limit exceeded: {actual} > {limit}")]
    ResourceLimitExceeded { limit: usize, actual: usize },
}

/// Configuration for validation limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_ops_per_message: usize,
    pub max_message_bytes: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_ops_per_message: 10_000,
            max_message_bytes: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// Validate an operation batch against configured limits
pub fn validate_batch(ops: &[Operation], limits: &ValidationLimits) -> Result<(), DecodeError> {
    if ops.len() > limits.max_ops_per_message {
        return Err(DecodeError::ResourceLimitExceeded {
            limit: limits.max_ops_per_message,
            actual: ops.len(),
        });
    }

    for op in ops {
        let op_id = op.id();
        // Counters start at 1
        if op_id.counter == 0 {
            return Err(DecodeError::MalformedOperation {
                op_id,
                reason: "counter cannot be zero".to_string(),
            });
        }
        if let SequenceOp::Delete { target, .. } = op {
            if *target == op_id {
                return Err(DecodeError::MalformedOperation {
                    op_id,
                    reason: "delete targets itself".to_string(),
                });
            }
            if target.counter == 0 {
                return Err(DecodeError::MalformedOperation {
                    op_id,
                    reason: "delete target counter cannot be zero".to_string(),
                });
            }
        }
    }

    Ok(())
}
