//! SASL authentication used during the channel handshake.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use cql_core::{ConnectionError, DriverError, Result};

/// Answers the authentication exchange requested by a server.
///
/// One authenticator instance may serve many channels concurrently.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Produces the first token after the server sent `AUTHENTICATE` naming
    /// its authenticator class.
    async fn initial_response(&self, address: SocketAddr, authenticator: &str) -> Result<Bytes>;

    /// Answers a challenge. The default rejects multi-step exchanges.
    async fn evaluate_challenge(
        &self,
        address: SocketAddr,
        challenge: Option<Bytes>,
    ) -> Result<Bytes> {
        let _ = challenge;
        Err(DriverError::from(ConnectionError::Authentication(format!(
            "unexpected authentication challenge from {}",
            address
        ))))
    }

    /// Called when the server accepts the exchange.
    async fn on_authentication_success(&self, address: SocketAddr, token: Option<Bytes>) {
        let _ = (address, token);
    }
}

impl std::fmt::Debug for dyn Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Authenticator")
    }
}

/// Username and password authentication (`PasswordAuthenticator`).
#[derive(Clone)]
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    /// Creates an authenticator for the given credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn token(&self) -> Bytes {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        Bytes::from(token)
    }
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for PlainTextAuthenticator {
    async fn initial_response(&self, address: SocketAddr, authenticator: &str) -> Result<Bytes> {
        tracing::debug!(%address, authenticator, "sending plain text credentials");
        Ok(self.token())
    }
}
