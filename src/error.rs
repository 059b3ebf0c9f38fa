use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! invariant_error {
    ($msg:expr) => {
        crate::Error::InvariantViolation($msg.to_string())
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::InvariantViolation(format!($fmt, $($arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can
/// potentially return.
///
/// The taxonomy follows the failure modes of the decompilation core: undecodable
/// metadata, broken structural invariants, reflection-name grammar errors, failing
/// transform passes, and cooperative cancellation.
///
/// # Error Categories
///
/// ## Metadata Errors
/// - [`Error::Malformed`] - An upstream handle, signature, or method body cannot be decoded
/// - [`Error::NotSupported`] - An opcode or signature element outside the supported subset
/// - [`Error::OutOfBounds`] - A read past the end of a method-body buffer
///
/// ## Structural Errors
/// - [`Error::InvariantViolation`] - An internal IL-tree invariant broke (parent/child
///   mismatch, use-count drift, misuse of the mutation API). Fatal.
///
/// ## User-Facing Errors
/// - [`Error::ReflectionNameParse`] - Grammar error in a user-supplied reflection name
/// - [`Error::UnknownSetting`] - An unrecognized setting name at load time
///
/// ## Pipeline Errors
/// - [`Error::TransformFailure`] - A pass failed unexpectedly; the driver records the
///   pass and moves on to the next method
/// - [`Error::Cancelled`] - Cooperative cancellation was observed
#[derive(Error, Debug)]
pub enum Error {
    /// The metadata or method body is damaged and could not be decoded.
    ///
    /// The error includes the source location where the malformation was detected
    /// for debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while decoding a method body.
    #[error("Out of bound read would have occurred!")]
    OutOfBounds,

    /// The input uses an opcode or signature element outside the supported subset.
    #[error("This construct is not supported")]
    NotSupported,

    /// An internal structural invariant of the IL tree broke.
    ///
    /// This indicates a bug in a transform pass or misuse of the mutation API,
    /// such as attaching an instruction that already has a parent. These failures
    /// are fatal; there is no way to continue with a corrupted tree.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A reflection type name did not follow the grammar.
    ///
    /// Raised by [`crate::typesystem::parse_reflection_name`] for an empty name,
    /// a bare backtick, an unterminated bracket, a trailing `+`, a non-digit
    /// arity, or a suffix after `&`. Surfaced to the caller verbatim.
    #[error("Reflection name parse error at {position}: {message}")]
    ReflectionNameParse {
        /// What was wrong with the name
        message: String,
        /// Byte offset into the name at which the error was detected
        position: usize,
    },

    /// A transform pass failed unexpectedly.
    ///
    /// The pipeline driver wraps the underlying error together with the pass
    /// name and the offending block so the outer decompiler can emit a
    /// placeholder for the method and keep going.
    #[error("Transform '{pass}' failed at block {block}: {source}")]
    TransformFailure {
        /// Name of the pass that failed
        pass: &'static str,
        /// Child index of the block the pass was working on, if known
        block: usize,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },

    /// An unknown setting name was supplied at load time.
    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    /// Cooperative cancellation was observed; the current method is discarded.
    #[error("Operation was cancelled")]
    Cancelled,
}
