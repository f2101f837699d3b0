//! Process-wide default client.
//!
//! Code that cannot thread a [`Client`] through its call graph can install
//! one here once and look it up later. Nothing in the crate reads the
//! default implicitly.
//!
//! ```no_run
//! use natswire_client::{default_client, Client};
//!
//! # async fn run() -> natswire_client::Result<()> {
//! let client = Client::builder().connect("127.0.0.1", 4222).await?;
//! default_client::set_default(client).expect("default client already set");
//!
//! if let Some(client) = default_client::get() {
//!     client.publish("events.started", "ok")?;
//! }
//! # Ok(())
//! # }
//! ```

use parking_lot::{const_rwlock, RwLock};

use crate::client::Client;

static DEFAULT: RwLock<Option<Client>> = const_rwlock(None);

/// Install `client` as the default.
///
/// Fails with the client handed back if a default is already set.
pub fn set_default(client: Client) -> Result<(), Client> {
    let mut slot = DEFAULT.write();
    if slot.is_some() {
        return Err(client);
    }
    *slot = Some(client);
    Ok(())
}

/// A handle to the default client, if one is set.
pub fn get() -> Option<Client> {
    DEFAULT.read().clone()
}

/// Remove the default and return it.
///
/// The connection stays open while other handles to it exist.
pub fn clear() -> Option<Client> {
    DEFAULT.write().take()
}
