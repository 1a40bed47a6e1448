//! Authentication extractor.
//!
//! Requests carry `Authorization: Bearer <token>`. When `AUTH_SECRET` is set
//! the token must equal it; when unset every caller is accepted anonymously.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use quarry_engine::Error;

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from a request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The bearer token, or `anonymous`
    pub token: String,
}

impl AuthUser {
    /// Check an `Authorization` header value against the configured secret.
    pub fn authenticate(header: Option<&str>, secret: Option<&str>) -> Result<Self, Error> {
        let token = match header {
            Some(header) => header
                .strip_prefix("Bearer ")
                .map(str::trim)
                .ok_or_else(|| Error::Auth("invalid authorization header format".into()))?,
            None => {
                return match secret {
                    Some(_) => Err(Error::Auth("missing authorization header".into())),
                    None => Ok(AuthUser {
                        token: "anonymous".to_string(),
                    }),
                }
            }
        };

        if token.is_empty() {
            return Err(Error::Auth("empty bearer token".into()));
        }
        if let Some(secret) = secret {
            if token != secret {
                return Err(Error::Auth("invalid token".into()));
            }
        }

        Ok(AuthUser {
            token: token.to_string(),
        })
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        Self::authenticate(header, state.config.auth_secret.as_deref()).map_err(AppError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_engine::ErrorKind;

    #[test]
    fn anonymous_without_secret() {
        let user = AuthUser::authenticate(None, None).unwrap();
        assert_eq!(user.token, "anonymous");

        let user = AuthUser::authenticate(Some("Bearer anything"), None).unwrap();
        assert_eq!(user.token, "anything");
    }

    #[test]
    fn secret_must_match() {
        assert!(AuthUser::authenticate(Some("Bearer s3cret"), Some("s3cret")).is_ok());

        for header in [None, Some("Bearer wrong"), Some("Bearer "), Some("Basic s3cret")] {
            let err = AuthUser::authenticate(header, Some("s3cret")).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Auth, "{header:?}");
        }
    }
}
