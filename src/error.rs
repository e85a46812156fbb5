use derive_more::{Display, Error};

/// Error taxonomy shared by every engine operation.
///
/// Checks (`check`, `check_metadata`, `empdag_check`) log every violation
/// through the `tracing` sink and return the *first* non-OK status; all
/// other operations short-circuit on the first failure.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum Error {
    #[display("a required input was absent: {_0}")]
    MissingInput(#[error(not(source))] &'static str),

    #[display("value out of its declared domain: {_0}")]
    InvalidValue(#[error(not(source))] String),

    #[display("shape or type violation at an API boundary: {_0}")]
    InvalidArgument(#[error(not(source))] String),

    #[display("index {idx} out of range (len {len})")]
    IndexOutOfRange { idx: usize, len: usize },

    #[display("lookup for '{_0}' returned nothing")]
    NotFound(#[error(not(source))] String),

    #[display("entity in a state that forbids the operation: {_0}")]
    UnexpectedData(#[error(not(source))] String),

    #[display("two sources of truth disagree: {_0}")]
    Inconsistency(#[error(not(source))] String),

    #[display("invalid model: {_0}")]
    InvalidModel(#[error(not(source))] String),

    #[display("incorrect EMP input: {_0}")]
    EmpIncorrectInput(#[error(not(source))] String),

    #[display("EMP runtime failure: {_0}")]
    EmpRuntimeError(#[error(not(source))] String),

    #[display("model metadata is incomplete: {_0}")]
    IncompleteMetadata(#[error(not(source))] String),

    #[display("operation not allowed: {_0}")]
    OperationNotAllowed(#[error(not(source))] String),

    #[display("wrong model kind for this function: expected {expected}, got {got}")]
    WrongModelForFunction {
        expected: &'static str,
        got: &'static str,
    },

    #[display("not implemented: {_0}")]
    NotImplemented(#[error(not(source))] &'static str),

    #[display("memory reservation failed")]
    InsufficientMemory,

    #[display("system failure: {_0}")]
    SystemError(#[error(not(source))] String),

    #[display("could not open file '{_0}'")]
    FileOpenFailed(#[error(not(source))] String),

    #[display("runtime invariant broken: {_0}")]
    RuntimeError(#[error(not(source))] String),
}

impl Error {
    /// Keep the first failure when accumulating diagnostics in a check.
    pub fn fold(status: Result<(), Error>, err: Error) -> Result<(), Error> {
        match status {
            Ok(()) => Err(err),
            Err(first) => Err(first),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let e = Error::IndexOutOfRange { idx: 12, len: 3 };
        assert_eq!(e.to_string(), "index 12 out of range (len 3)");
        let e = Error::WrongModelForFunction {
            expected: "mcp",
            got: "nlp",
        };
        assert_eq!(
            e.to_string(),
            "wrong model kind for this function: expected mcp, got nlp"
        );
    }

    #[test]
    fn fold_keeps_first_failure() {
        let first = Error::NotFound("x".into());
        let folded = Error::fold(Err(first.clone()), Error::InsufficientMemory);
        assert_eq!(folded.unwrap_err(), first);
        let fresh = Error::fold(Ok(()), Error::InsufficientMemory);
        assert_eq!(fresh.unwrap_err(), Error::InsufficientMemory);
    }
}
