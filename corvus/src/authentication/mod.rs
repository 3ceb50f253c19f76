//! The SASL-style challenge/response authentication contract.
//!
//! When a server answers STARTUP with AUTHENTICATE, the driver asks its
//! configured [AuthenticatorProvider] for a session and shuttles tokens
//! between the server and that session until AUTH_SUCCESS or an error.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// An error reported by an authenticator implementation.
pub type AuthError = String;

/// Per-connection authentication state machine.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Evaluates a server challenge and produces the next token to send.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called on AUTH_SUCCESS with the server's final token.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Produces authentication sessions for new connections.
#[async_trait]
pub trait AuthenticatorProvider: Send + Sync {
    /// Starts a fresh exchange for the mechanism the server named; returns
    /// the initial response token and the session driving the rest.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during plain-text authentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username/password authentication: sends `\0username\0password` as the
/// initial SASL response.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        let mut response = BytesMut::new();
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());

        Ok((
            Some(response.to_vec()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_initial_response_layout() {
        let provider = PlainTextAuthenticator::new("user", "pass");
        let (initial, _session) = provider
            .start_authentication_session("PasswordAuthenticator")
            .await
            .unwrap();
        assert_eq!(initial.unwrap(), b"\0user\0pass");
    }
}
