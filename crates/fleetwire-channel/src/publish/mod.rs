//! Publish/subscribe channel.
//!
//! A [`PublishServer`] daemon fans every message out to its connected
//! subscribers; [`PublishClient`] is the subscriber side.

mod client;
mod fanout;
mod server;

pub use client::PublishClient;
pub use fanout::{
    Fanout, IdentityFilter, PresenceHook, PublishReport, SubscriberFilter, SubscriberInfo,
};
pub use server::{PublishServer, IDENTITY_KEY, PAYLOAD_KEY, TOPICS_KEY};
