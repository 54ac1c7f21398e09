//! Outgoing messages produced by script runs.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Position of a delta within the client UI tree.
pub type DeltaPath = Vec<u32>;

/// Content digest of a message body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHash(String);

impl MessageHash {
    /// Compute the digest of a message body.
    ///
    /// Only the body contributes; metadata such as the target path does not.
    #[must_use]
    pub fn of(body: &MessageBody) -> Self {
        let mut hasher = Sha256::new();
        match body {
            MessageBody::Delta { data } => {
                hasher.update(b"delta:");
                hasher.update(data);
            }
            MessageBody::ScriptFinished { status } => {
                hasher.update(b"script_finished:");
                hasher.update(status.as_str().as_bytes());
            }
            MessageBody::Exception { message } => {
                hasher.update(b"exception:");
                hasher.update(message.as_bytes());
            }
            MessageBody::RefHash { hash } => {
                hasher.update(b"ref_hash:");
                hasher.update(hash.as_str().as_bytes());
            }
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Hex representation of the digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a script run ended, as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFinishedStatus {
    /// Full run completed.
    FinishedSuccessfully,
    /// Script could not be compiled.
    FinishedWithCompileError,
    /// Run was preempted by a rerun request.
    FinishedEarlyForRerun,
    /// A fragment-only run completed.
    FinishedFragmentRunSuccessfully,
}

impl ScriptFinishedStatus {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FinishedSuccessfully => "finished_successfully",
            Self::FinishedWithCompileError => "finished_with_compile_error",
            Self::FinishedEarlyForRerun => "finished_early_for_rerun",
            Self::FinishedFragmentRunSuccessfully => "finished_fragment_run_successfully",
        }
    }

    /// Classification used for cache aging.
    #[must_use]
    pub const fn run_kind(self) -> RunKind {
        match self {
            Self::FinishedSuccessfully | Self::FinishedEarlyForRerun => RunKind::Full,
            Self::FinishedFragmentRunSuccessfully => RunKind::Fragment,
            Self::FinishedWithCompileError => RunKind::CompileError,
        }
    }
}

/// Run completion classes that drive cache aging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Full,
    Fragment,
    CompileError,
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Opaque UI delta.
    Delta { data: Bytes },
    /// Script run completion notice.
    ScriptFinished { status: ScriptFinishedStatus },
    /// Error to display to the user.
    Exception { message: String },
    /// Reference to content the client already holds.
    RefHash { hash: MessageHash },
}

/// Per-message metadata. Never part of the hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Whether the payload may be stored in the message cache.
    #[serde(default)]
    pub cacheable: bool,
    /// UI position this delta mutates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<DeltaPath>,
}

/// Immutable unit of script output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    hash: MessageHash,
    body: MessageBody,
    metadata: MessageMetadata,
}

impl Message {
    /// Create a message, computing its content hash.
    #[must_use]
    pub fn new(body: MessageBody, metadata: MessageMetadata) -> Self {
        let hash = MessageHash::of(&body);
        Self {
            hash,
            body,
            metadata,
        }
    }

    /// Create a delta addressed to a UI position.
    #[must_use]
    pub fn delta(data: impl Into<Bytes>, target_path: DeltaPath) -> Self {
        Self::new(
            MessageBody::Delta { data: data.into() },
            MessageMetadata {
                cacheable: false,
                target_path: Some(target_path),
            },
        )
    }

    /// Create a script-finished notice.
    #[must_use]
    pub fn script_finished(status: ScriptFinishedStatus) -> Self {
        Self::new(
            MessageBody::ScriptFinished { status },
            MessageMetadata::default(),
        )
    }

    /// Create an exception notice.
    #[must_use]
    pub fn exception(message: impl Into<String>) -> Self {
        Self::new(
            MessageBody::Exception {
                message: message.into(),
            },
            MessageMetadata::default(),
        )
    }

    /// Create a reference to `original`'s content.
    ///
    /// The reference keeps `original`'s metadata so the receiver can place it,
    /// and reports the referenced hash as its own.
    #[must_use]
    pub fn ref_hash(original: &Self) -> Self {
        Self {
            hash: original.hash.clone(),
            body: MessageBody::RefHash {
                hash: original.hash.clone(),
            },
            metadata: original.metadata.clone(),
        }
    }

    #[must_use]
    pub const fn hash(&self) -> &MessageHash {
        &self.hash
    }

    #[must_use]
    pub const fn body(&self) -> &MessageBody {
        &self.body
    }

    #[must_use]
    pub const fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    /// UI position used for outbox coalescing, if any.
    #[must_use]
    pub fn target_path(&self) -> Option<&[u32]> {
        self.metadata.target_path.as_deref()
    }

    #[must_use]
    pub const fn is_cacheable(&self) -> bool {
        self.metadata.cacheable
    }

    #[must_use]
    pub const fn is_ref_hash(&self) -> bool {
        matches!(self.body, MessageBody::RefHash { .. })
    }

    /// Size of the payload that counts against the cache threshold.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match &self.body {
            MessageBody::Delta { data } => data.len(),
            _ => 0,
        }
    }

    /// Set the cacheable flag. Only deltas can be cached.
    #[must_use]
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.metadata.cacheable = cacheable && matches!(self.body, MessageBody::Delta { .. });
        self
    }

    /// Completion status if this is a script-finished notice.
    #[must_use]
    pub const fn finished_status(&self) -> Option<ScriptFinishedStatus> {
        match self.body {
            MessageBody::ScriptFinished { status } => Some(status),
            _ => None,
        }
    }
}
