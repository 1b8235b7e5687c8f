//! Request validation and command dispatch.
//!
//! One request goes parse → authenticate → resolve → invoke → classify. Each
//! failure maps to exactly one [`ErrorKind`].

use std::panic::{self, AssertUnwindSafe};

use serde_json::{Map, Value};

use havoc::protocol::{ErrorEnvelope, ErrorKind};

use crate::commands::{lookup, Agent};
use crate::error::CommandError;

const GENERIC_FAILURE: &str =
    "Unexpected error occurred. Raise the agent log level to debug for details";

pub struct Validator {
    key_digest: String,
    agent: Agent,
    verbose_errors: bool,
}

impl Validator {
    pub fn new(key_digest: String, agent: Agent, verbose_errors: bool) -> Self {
        Self {
            key_digest,
            agent,
            verbose_errors,
        }
    }

    /// Validate a raw request body and run the command it names.
    pub fn validate_and_run(&self, body: &[u8]) -> Result<Value, ErrorEnvelope> {
        let envelope: Map<String, Value> = match serde_json::from_slice(body) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                return Err(ErrorEnvelope::new(
                    ErrorKind::BadRequest,
                    "Request must be a JSON object",
                ))
            }
        };

        let key = envelope.get("key").and_then(Value::as_str);
        if key != Some(self.key_digest.as_str()) {
            tracing::warn!("Rejected request with a bad key");
            return Err(ErrorEnvelope::new(
                ErrorKind::AuthorizationFailed,
                "Authorisation failed",
            ));
        }

        let Some(command) = envelope.get("command").and_then(Value::as_str) else {
            return Err(ErrorEnvelope::new(ErrorKind::BadRequest, "No command specified"));
        };

        let Some(handler) = lookup(command) else {
            return Err(ErrorEnvelope::new(
                ErrorKind::WrongCommand,
                format!("Unknown command '{}'", command),
            ));
        };

        let arguments = match envelope.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(ErrorEnvelope::new(
                    ErrorKind::WrongParameters,
                    format!("Arguments must be an object, got {}", other),
                ))
            }
        };

        tracing::info!("Running {}", command);
        tracing::debug!("Arguments for {}: {:?}", command, arguments);

        match panic::catch_unwind(AssertUnwindSafe(|| handler(&self.agent, arguments))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ (CommandError::InvalidArgument(_) | CommandError::WrongParameters(_)))) => {
                tracing::info!("{} rejected its arguments: {}", command, e);
                Err(ErrorEnvelope::new(e.kind(), e.to_string()))
            }
            Ok(Err(e)) => {
                tracing::error!("{} failed: {}", command, e);
                Err(self.unexpected(&e.to_string(), body))
            }
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                tracing::error!("{} panicked: {}", command, detail);
                Err(self.unexpected(&detail, body))
            }
        }
    }

    fn unexpected(&self, detail: &str, body: &[u8]) -> ErrorEnvelope {
        let value = if self.verbose_errors {
            format!(
                "{}\nRequest: {}",
                detail,
                String::from_utf8_lossy(body)
            )
        } else {
            GENERIC_FAILURE.to_string()
        };
        ErrorEnvelope::new(ErrorKind::UnexpectedError, value)
    }
}
