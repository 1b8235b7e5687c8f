//! Errors raised by the command surface.

use thiserror::Error;

use havoc::protocol::ErrorKind;

#[derive(Debug, Error)]
pub enum CommandError {
    /// A required selector is missing or a value is malformed.
    #[error("{0}")]
    InvalidArgument(String),

    /// The arguments object does not fit the command's signature.
    #[error("{0}")]
    WrongParameters(String),

    #[error("{0}")]
    Unexpected(String),
}

impl CommandError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Wire classification. Invalid arguments have no kind of their own and
    /// are reported as wrong parameters.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::WrongParameters(_) => ErrorKind::WrongParameters,
            Self::Unexpected(_) => ErrorKind::UnexpectedError,
        }
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        Self::WrongParameters(e.to_string())
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        Self::Unexpected(e.to_string())
    }
}

pub type CommandResult<T> = std::result::Result<T, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_maps_to_wrong_parameters() {
        let err = CommandError::invalid("Specify at least one pid or name");
        assert_eq!(err.kind(), ErrorKind::WrongParameters);
        assert_eq!(err.to_string(), "Specify at least one pid or name");
    }

    #[test]
    fn test_io_error_is_unexpected() {
        let err: CommandError = std::io::Error::other("disk on fire").into();
        assert_eq!(err.kind(), ErrorKind::UnexpectedError);
    }
}
