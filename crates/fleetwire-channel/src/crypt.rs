//! Payload encryption hooks.
//!
//! Key management and cipher choice live outside this crate. Channels only
//! see an opaque collaborator that turns messages into wire payloads and
//! back, and can be asked to re-authenticate.

use async_trait::async_trait;
use fleetwire_frame::Message;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptError {
    /// Credentials are stale or rejected; a re-auth may fix it.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait PayloadCrypt: Send + Sync {
    fn encrypt(&self, load: &Message) -> Result<Message, CryptError>;

    /// Called on every payload received from the peer.
    fn decrypt(&self, wire: &Message) -> Result<Message, CryptError>;

    /// Refresh credentials after an authentication failure.
    async fn reauth(&self) -> Result<(), CryptError>;
}

/// Pass-through crypt for unencrypted deployments and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearText;

#[async_trait]
impl PayloadCrypt for ClearText {
    fn encrypt(&self, load: &Message) -> Result<Message, CryptError> {
        Ok(load.clone())
    }

    fn decrypt(&self, wire: &Message) -> Result<Message, CryptError> {
        Ok(wire.clone())
    }

    async fn reauth(&self) -> Result<(), CryptError> {
        Ok(())
    }
}
