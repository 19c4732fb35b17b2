use thiserror::Error;

/// Failures surfaced by the log and its reader.
///
/// Storage trouble is not among them: write errors are logged and counted by
/// the background writer and never reach the producer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataLogError {
    /// The log was closed; this is a usage bug in the caller.
    #[error("data log is closed")]
    Closed,

    #[error("payload of {0} bytes does not fit in a record")]
    PayloadTooLarge(usize),

    /// A value encoder wrote a different number of bytes than it declared.
    #[error("payload declared {declared} bytes but {written} were written")]
    SizeMismatch { declared: usize, written: usize },

    /// A struct schema refers back to itself through its nested structs.
    #[error("{0}: circular struct reference")]
    CircularStruct(String),

    #[error("invalid data log header")]
    InvalidHeader,

    #[error("unsupported data log version {0:#06x}")]
    UnsupportedVersion(u16),

    /// A typed accessor was used on a record of a different shape.
    #[error("record is not a valid {0} record")]
    TypeMismatch(&'static str),

    #[error("record contains invalid UTF-8")]
    InvalidUtf8,
}
