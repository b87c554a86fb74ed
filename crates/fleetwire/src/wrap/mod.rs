//! Adapters that wrap any channel or service.
//!
//! Wrappers implement the same traits as what they wrap, so they nest:
//! `SyncRequestChannel<Traced<RequestClient>>` is a blocking client that
//! logs every call.

mod sync;
mod trace;

pub use sync::{SyncPublishChannel, SyncPublishService, SyncRequestChannel};
pub use trace::Traced;
