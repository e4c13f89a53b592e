use thiserror::Error;

use crate::memory::MemoryError;
use crate::metadata::ShaderStage;
use crate::token::TokenSet;

/// Problems with an [`IndirectCommandLayoutDesc`](crate::layout::IndirectCommandLayoutDesc).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("layout must contain exactly one action token, found {found}")]
    ActionTokenCount { found: usize },

    #[error("token {token:?} appears more than once")]
    DuplicateToken { token: TokenSet },

    #[error("input stride {stride} must be non-zero and a multiple of 4")]
    InvalidStride { stride: u32 },

    #[error("token {token:?} reads {size} bytes at offset {offset}, outside input stride {stride}")]
    TokenOutOfBounds {
        token: TokenSet,
        offset: u32,
        size: u32,
        stride: u32,
    },

    #[error("token {token:?} offset {offset} is not 4-byte aligned")]
    UnalignedTokenOffset { token: TokenSet, offset: u32 },

    #[error("token {token:?} is not valid for this layout kind")]
    TokenNotAllowed { token: TokenSet },

    #[error("stage set {stages:#x} does not match the action token")]
    StageMismatch { stages: u32 },

    #[error("push constant range {offset}..{end} is invalid (word aligned, non-empty, at most {max} bytes)")]
    PushConstantRange { offset: u32, end: u32, max: u32 },

    #[error("push constant word {word} is written by more than one token")]
    PushConstantOverlap { word: u32 },

    #[error("vertex binding {slot} is out of range (max {max})")]
    VertexBindingOutOfRange { slot: u32, max: u32 },

    #[error("vertex binding {slot} is bound more than once")]
    DuplicateVertexBinding { slot: u32 },
}

/// Errors surfaced by [`DgcService`](crate::service::DgcService) and its helpers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DgcError {
    #[error("DGC service is not initialised")]
    NotInitialized,

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("out of memory allocating {size} bytes of upload space")]
    OutOfMemory { size: u64 },

    #[error("output buffer too small: need {required} bytes, have {provided}")]
    OutputTooSmall { required: u64, provided: u64 },

    #[error(
        "sequence {sequence} selects execution set entry {index}, but the set has {entry_count} entries"
    )]
    ExecutionSetIndexOutOfRange {
        sequence: u32,
        index: u32,
        entry_count: u32,
    },

    #[error("execution set entry needs {words} command words, limit is {max}")]
    ExecutionSetEntryTooLarge { words: usize, max: u32 },

    #[error("pipeline does not match the execution set: {reason}")]
    ExecutionSetMismatch { reason: &'static str },

    #[error("pipeline metadata lacks the {stage:?} stage required by the layout")]
    MissingStage { stage: ShaderStage },

    #[error("invalid generation request: {0}")]
    InvalidRequest(&'static str),
}
