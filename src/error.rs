use thiserror::Error;

/// Failures that cross a request or trigger boundary.
///
/// Internal plumbing (config, keys, storage) uses [`anyhow::Error`]; whatever
/// reaches a caller is folded into one of these variants first so the HTTP
/// status and user-facing message are decided in one place.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed, expired or unverifiable identity token or session credential.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// No session credential at all.
    #[error("no valid session")]
    Unauthenticated,

    /// Valid session, insufficient claim.
    #[error("permission denied")]
    PermissionDenied,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("document store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

impl AuthError {
    pub fn store(err: anyhow::Error) -> Self {
        Self::StoreUnavailable(format!("{err:#}"))
    }

    pub fn provider(err: impl ToString) -> Self {
        Self::ProviderUnavailable(err.to_string())
    }

    /// Infrastructure hiccups that deserve exactly one more attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::StoreUnavailable(_)
        )
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidToken(_) | Self::Unauthenticated => 401,
            Self::PermissionDenied => 403,
            Self::NotFound(_) => 404,
            Self::ProviderUnavailable(_) | Self::StoreUnavailable(_) => 503,
            Self::InvalidArgument(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken(_) => "invalid-token",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission-denied",
            Self::NotFound(_) => "not-found",
            Self::ProviderUnavailable(_) | Self::StoreUnavailable(_) => "unavailable",
            Self::InvalidArgument(_) => "invalid-argument",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to show an end user. Never echoes lookup keys, so a
    /// caller cannot probe which emails exist.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidToken(_) | Self::Unauthenticated => {
                String::from("Please sign in again")
            }
            Self::PermissionDenied => String::from("Operation not allowed"),
            Self::NotFound(_) => String::from("Request failed"),
            Self::ProviderUnavailable(_) | Self::StoreUnavailable(_) => {
                String::from("Service temporarily unavailable, please try again")
            }
            Self::InvalidArgument(msg) => msg.clone(),
            Self::Internal(_) => String::from("Request failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        let cases = [
            (AuthError::InvalidToken("bad".into()), 401, "invalid-token"),
            (AuthError::Unauthenticated, 401, "unauthenticated"),
            (AuthError::PermissionDenied, 403, "permission-denied"),
            (AuthError::NotFound("x@y.com".into()), 404, "not-found"),
            (AuthError::provider("down"), 503, "unavailable"),
            (AuthError::StoreUnavailable("locked".into()), 503, "unavailable"),
            (AuthError::InvalidArgument("email".into()), 400, "invalid-argument"),
            (AuthError::Internal("boom".into()), 500, "internal"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status, "{err}");
            assert_eq!(err.code(), code, "{err}");
        }

        assert!(AuthError::provider("down").is_transient());
        assert!(AuthError::StoreUnavailable(String::new()).is_transient());
        assert!(!AuthError::InvalidToken(String::new()).is_transient());

        let msg = AuthError::NotFound("alice@example.com".into()).public_message();
        assert!(!msg.contains("alice"));
    }
}
