//! Caller authentication for the stream and publish routes.
//!
//! Browsers cannot attach headers to a native event stream request, so the
//! bearer token is accepted either as `Authorization: Bearer <token>` or as
//! an `access_token` query parameter.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use secrecy::{ExposeSecret, SecretString};

/// An authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

/// Decides whether a presented credential identifies a caller.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, credential: Option<&str>) -> Option<Identity>;
}

/// Accepts a fixed set of bearer tokens.
///
/// An empty token set rejects every request.
pub struct StaticTokenAuthenticator {
    tokens: Vec<SecretString>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: Vec<SecretString>) -> Self {
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: Option<&str>) -> Option<Identity> {
        let presented = credential?;
        self.tokens
            .iter()
            .position(|t| constant_time_eq(t.expose_secret().as_bytes(), presented.as_bytes()))
            .map(|index| Identity {
                subject: format!("token:{index}"),
            })
    }
}

/// Pull the bearer credential from the request, header first.
pub fn extract_credential<'a>(headers: &'a HeaderMap, access_token: Option<&'a str>) -> Option<&'a str> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty());

    from_header.or(access_token.filter(|t| !t.is_empty()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn authenticator() -> StaticTokenAuthenticator {
        StaticTokenAuthenticator::new(vec![
            SecretString::from("alpha".to_string()),
            SecretString::from("beta".to_string()),
        ])
    }

    #[tokio::test]
    async fn known_token_authenticates() {
        let auth = authenticator();
        let identity = auth.authenticate(Some("beta")).await.unwrap();
        assert_eq!(identity.subject, "token:1");
    }

    #[tokio::test]
    async fn unknown_or_missing_token_rejected() {
        let auth = authenticator();
        assert!(auth.authenticate(Some("gamma")).await.is_none());
        assert!(auth.authenticate(Some("alph")).await.is_none());
        assert!(auth.authenticate(None).await.is_none());
    }

    #[tokio::test]
    async fn empty_token_set_rejects_everything() {
        let auth = StaticTokenAuthenticator::new(Vec::new());
        assert!(auth.is_empty());
        assert!(auth.authenticate(Some("")).await.is_none());
        assert!(auth.authenticate(Some("anything")).await.is_none());
    }

    #[test]
    fn credential_from_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer alpha"));
        assert_eq!(extract_credential(&headers, Some("beta")), Some("alpha"));
    }

    #[test]
    fn credential_from_query_when_no_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_credential(&headers, Some("beta")), Some("beta"));
        assert_eq!(extract_credential(&headers, Some("")), None);
        assert_eq!(extract_credential(&headers, None), None);
    }

    #[test]
    fn non_bearer_scheme_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(extract_credential(&headers, None), None);
    }
}
