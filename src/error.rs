use thiserror::Error;

/// Errors surfaced by the codestream parser and the rate allocator.
///
/// Only conditions a caller can meaningfully react to live here:
/// malformed input and infeasible rate targets. Misuse of the API
/// (illegal policy codes, out-of-contract tag-tree queries, geometry
/// lookups for a tile that is not current) is a programming error and
/// panics instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum J2kError {
    /// The codestream violates ISO/IEC 15444-1 syntax or carries a field
    /// value this implementation rejects (unsupported quantization style,
    /// oversized code-blocks, unknown wavelet kernel, misplaced marker).
    #[error("corrupted codestream: {0}")]
    CorruptedCodestream(String),

    /// Ran off the end of the data while a marker segment promised more.
    #[error("need more data")]
    NeedMoreData,

    /// A configuration toggle could not be resolved into coder options.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The requested total byte budget cannot accommodate the mandatory
    /// per-layer/per-packet header overhead.
    #[error("target length infeasible: {0}")]
    RateInfeasible(String),
}

impl J2kError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptedCodestream(msg.into())
    }
}
