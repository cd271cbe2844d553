use crate::parser::ParseError;
use crate::runtime::diagnostics::ResultCode;
use crate::runtime::Trap;

/// Every failure the embedding API reports
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("link error: {0}")]
    Link(String),
    #[error("trap: {0}")]
    Trap(#[from] Trap),
    #[error("argument type mismatch: {0}")]
    ArgMismatch(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn link(msg: impl Into<String>) -> Self {
        Error::Link(msg.into())
    }

    pub fn arg_mismatch(msg: impl Into<String>) -> Self {
        Error::ArgMismatch(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Result code category of this error
    pub fn code(&self) -> ResultCode {
        match self {
            Error::Parse(_) => ResultCode::ParseError,
            Error::Link(_) => ResultCode::LinkError,
            Error::Trap(_) => ResultCode::TrapError,
            Error::ArgMismatch(_) => ResultCode::ArgMismatch,
            Error::NotFound(_) => ResultCode::NotFound,
            Error::InvalidState(_) => ResultCode::InvalidState,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParseErrorKind;

    #[test]
    fn codes_follow_variants() {
        let parse = Error::from(ParseError::new(0, ParseErrorKind::BadMagic));
        assert_eq!(parse.code(), ResultCode::ParseError);
        assert_eq!(Error::from(Trap::Unreachable).code(), ResultCode::TrapError);
        assert_eq!(Error::link("x").code(), ResultCode::LinkError);
        assert_eq!(Error::arg_mismatch("x").code(), ResultCode::ArgMismatch);
        assert_eq!(Error::not_found("x").code(), ResultCode::NotFound);
        assert_eq!(Error::invalid_state("x").code(), ResultCode::InvalidState);
    }

    #[test]
    fn messages() {
        assert_eq!(Error::from(Trap::IntegerDivideByZero).to_string(), "trap: integer divide by zero");
        assert_eq!(Error::not_found("missing").to_string(), "not found: missing");
    }
}
