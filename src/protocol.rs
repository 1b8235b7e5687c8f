//! Wire protocol shared by the driver and the agent.
//!
//! A request is a JSON envelope POSTed to the agent's root path. The agent
//! answers with the command result (200) or an [`ErrorEnvelope`] (403).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Default port the agent listens on.
pub const DEFAULT_AGENT_PORT: u16 = 6969;

/// Request body sent from the driver to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
    pub key: String,
}

impl CommandEnvelope {
    /// Build an envelope for `command`, authenticated with `secret`.
    ///
    /// The secret itself never travels; only its digest does.
    pub fn new(command: impl Into<String>, arguments: Option<Map<String, Value>>, secret: &str) -> Self {
        Self {
            command: command.into(),
            arguments,
            key: key_digest(secret),
        }
    }
}

/// Lowercase hex SHA-256 digest of a node secret.
pub fn key_digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Join CLI words into a command name (`get process` -> `get_process`).
pub fn command_name<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| w.as_ref().trim())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

/// Uniform result of fire-and-forget operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: Status,
    pub message: String,
}

impl OperationResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Failure classes reported instead of a command result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    AuthorizationFailed,
    WrongCommand,
    WrongParameters,
    UnexpectedError,
    /// Driver side only: the node could not be reached or answered garbage.
    TransportError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::AuthorizationFailed => "authorization_failed",
            Self::WrongCommand => "wrong_command",
            Self::WrongParameters => "wrong_parameters",
            Self::UnexpectedError => "unexpected_error",
            Self::TransportError => "transport_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{status: <error kind>, value: <message>}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub status: ErrorKind,
    pub value: String,
}

impl ErrorEnvelope {
    pub fn new(status: ErrorKind, value: impl Into<String>) -> Self {
        Self {
            status,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_digest_is_sha256_hex() {
        assert_eq!(
            key_digest("test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn test_envelope_carries_digest_not_secret() {
        let envelope = CommandEnvelope::new("list_process", None, "hunter2");
        assert_ne!(envelope.key, "hunter2");
        assert_eq!(envelope.key, key_digest("hunter2"));
    }

    #[test]
    fn test_envelope_omits_missing_arguments() {
        let envelope = CommandEnvelope::new("list_process", None, "k");
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("arguments").is_none());
        assert_eq!(json["command"], "list_process");
    }

    #[test]
    fn test_command_name_joins_words() {
        assert_eq!(command_name(&["get", "process"]), "get_process");
        assert_eq!(command_name(&["burn_cpu"]), "burn_cpu");
        assert_eq!(command_name::<&str>(&[]), "");
    }

    #[test]
    fn test_error_envelope_serialization() {
        let env = ErrorEnvelope::new(ErrorKind::AuthorizationFailed, "Authorisation failed");
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(
            json,
            r#"{"status":"authorization_failed","value":"Authorisation failed"}"#
        );
    }

    #[test]
    fn test_error_kind_display_matches_serde() {
        for kind in [
            ErrorKind::BadRequest,
            ErrorKind::AuthorizationFailed,
            ErrorKind::WrongCommand,
            ErrorKind::WrongParameters,
            ErrorKind::UnexpectedError,
            ErrorKind::TransportError,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_operation_result_shape() {
        let ok = OperationResult::success("CPU burning started");
        assert!(ok.is_success());
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["message"], "CPU burning started");
        assert!(!OperationResult::error("nope").is_success());
    }
}
