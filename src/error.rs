/// Errors from converter construction and conversion calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConvertError {
    /// The destination/source descriptor pair is internally inconsistent or
    /// no conversion algorithm supports it. Raised only during construction.
    #[error("unsupported or inconsistent pixel format combination")]
    InvalidFormat,

    /// Zero dimensions, a stride whose magnitude is smaller than a row, or a
    /// buffer slice too short for the requested region. Raised by the
    /// conversion call before any byte is written.
    #[error("invalid conversion argument")]
    InvalidArgument,

    /// Conversion was requested on a default-constructed converter.
    #[error("converter is not initialized")]
    NotInitialized,

    /// Allocating the shared palette table failed.
    #[error("allocation failed")]
    OutOfMemory,
}
