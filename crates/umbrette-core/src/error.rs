use thiserror::Error;

/// Machine-readable rejection result for NIP-01 `OK` and `CLOSED` replies.
///
/// The wire form is a single string `"<prefix>: <message>"` where the prefix
/// is everything before the first `": "`. Known prefixes are `duplicate`,
/// `pow`, `blocked`, `rate-limited`, `invalid` and `error`, but unknown
/// prefixes round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{prefix}: {message}")]
pub struct RelayError {
    pub prefix: String,
    pub message: String,
}

impl RelayError {
    pub fn new(prefix: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            message: message.into(),
        }
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new("duplicate", message)
    }

    pub fn pow(message: impl Into<String>) -> Self {
        Self::new("pow", message)
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new("blocked", message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new("rate-limited", message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new("invalid", message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", message)
    }

    /// Rebuild a `RelayError` from its wire reason. The prefix is taken
    /// verbatim, so reasons produced by other relays survive a round trip
    /// even when the prefix is not one this relay emits.
    pub fn from_reason(reason: &str) -> Self {
        match reason.split_once(": ") {
            Some((prefix, message)) => Self::new(prefix, message),
            None => Self::new(reason, ""),
        }
    }

    /// Interpret a relay `OK` reply, raising the reconstructed error when the
    /// event was not accepted.
    pub fn check_ok(accepted: bool, reason: &str) -> Result<(), RelayError> {
        if accepted {
            Ok(())
        } else {
            Err(RelayError::from_reason(reason))
        }
    }
}
