//! Channel construction by transport name.
//!
//! One table maps every accepted name to a [`Binding`]. The factories check
//! the configuration and the name before anything is bound or connected, so
//! a bad config fails synchronously with [`ChannelError::Config`].

use std::sync::Arc;

use fleetwire_channel::{
    Binding, ChannelError, PayloadCrypt, PublishChannel, PublishClient, PublishServer,
    PublishService, RequestChannel, RequestClient, RequestServer, RequestService, Result,
    TransportConfig,
};

/// A selectable transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportEntry {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub binding: Binding,
}

pub const DEFAULT_TRANSPORT: &str = "tcp";

pub const TRANSPORTS: &[TransportEntry] = &[
    TransportEntry {
        name: "tcp",
        aliases: &[],
        binding: Binding::Tcp,
    },
    TransportEntry {
        name: "ipc",
        aliases: &["unix"],
        binding: Binding::Ipc,
    },
    TransportEntry {
        name: "ws",
        aliases: &["websocket"],
        binding: Binding::WebSocket,
    },
];

/// Binding for a transport name (case-insensitive; empty means the default).
pub fn resolve(name: &str) -> Result<Binding> {
    let wanted = name.trim().to_ascii_lowercase();
    let wanted = if wanted.is_empty() {
        DEFAULT_TRANSPORT
    } else {
        wanted.as_str()
    };
    TRANSPORTS
        .iter()
        .find(|entry| entry.name == wanted || entry.aliases.contains(&wanted))
        .map(|entry| entry.binding)
        .ok_or_else(|| {
            ChannelError::Config(format!(
                "unknown transport {name:?}; available: {}",
                available().join(", ")
            ))
        })
}

/// Canonical transport names.
pub fn available() -> Vec<&'static str> {
    TRANSPORTS.iter().map(|entry| entry.name).collect()
}

fn binding_for(config: &TransportConfig) -> Result<Binding> {
    config.validate()?;
    resolve(&config.transport)
}

fn refuse_unencrypted(config: &TransportConfig) -> Result<()> {
    if config.encrypted_transfer {
        return Err(ChannelError::Config(
            "encrypted_transfer is enabled but no payload crypt was supplied".into(),
        ));
    }
    Ok(())
}

pub fn request_server(config: &TransportConfig) -> Result<Box<dyn RequestService>> {
    refuse_unencrypted(config)?;
    Ok(Box::new(RequestServer::new(config, binding_for(config)?)?))
}

pub fn request_server_with_crypt(
    config: &TransportConfig,
    crypt: Arc<dyn PayloadCrypt>,
) -> Result<Box<dyn RequestService>> {
    let server = RequestServer::new(config, binding_for(config)?)?.with_crypt(crypt);
    Ok(Box::new(server))
}

pub fn request_client(config: &TransportConfig) -> Result<Box<dyn RequestChannel>> {
    refuse_unencrypted(config)?;
    Ok(Box::new(RequestClient::new(config, binding_for(config)?)?))
}

pub fn request_client_with_crypt(
    config: &TransportConfig,
    crypt: Arc<dyn PayloadCrypt>,
) -> Result<Box<dyn RequestChannel>> {
    let client = RequestClient::new(config, binding_for(config)?)?.with_crypt(crypt);
    Ok(Box::new(client))
}

pub fn publish_server(config: &TransportConfig) -> Result<Box<dyn PublishService>> {
    Ok(Box::new(PublishServer::new(config, binding_for(config)?)?))
}

pub fn publish_client(config: &TransportConfig) -> Result<Box<dyn PublishChannel>> {
    Ok(Box::new(PublishClient::new(config, binding_for(config)?)?))
}
