use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal reasons a room subscription attempt can be denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    #[error("NOT_MEMBER")]
    NotMember,
    #[error("NOT_AUTHENTICATED")]
    NotAuthenticated,
    #[error("MEMBERSHIP_CHECK_FAILED")]
    MembershipCheckFailed,
}

/// Server-reported AI protocol error codes. Codes the client does not know
/// fold into `Unknown` instead of failing deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiErrorCode {
    #[error("INSUFFICIENT_TOKENS")]
    InsufficientTokens,
    #[error("PROMPT_TOO_LONG")]
    PromptTooLong,
    #[error("AUTH_ERROR")]
    AuthError,
    #[serde(other)]
    #[error("UNKNOWN")]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_reason_uses_wire_codes() {
        assert_eq!(
            serde_json::to_string(&DenyReason::NotMember).unwrap(),
            "\"NOT_MEMBER\""
        );
        assert_eq!(DenyReason::MembershipCheckFailed.to_string(), "MEMBERSHIP_CHECK_FAILED");
    }

    #[test]
    fn unclassified_ai_error_code_folds_into_unknown() {
        let code: AiErrorCode = serde_json::from_str("\"RATE_LIMITED\"").unwrap();
        assert_eq!(code, AiErrorCode::Unknown);

        let code: AiErrorCode = serde_json::from_str("\"PROMPT_TOO_LONG\"").unwrap();
        assert_eq!(code, AiErrorCode::PromptTooLong);
    }
}
