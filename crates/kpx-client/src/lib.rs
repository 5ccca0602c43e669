//! Client engine for the KeePassXC browser proxy.
//!
//! ```no_run
//! # async fn run() -> kpx_common::Result<()> {
//! use std::sync::Arc;
//! use kpx_client::{AssociationManager, ClientConfig, JsonFileStore, ProxyClient};
//!
//! let config = ClientConfig::from_env()?;
//! let store = JsonFileStore::new(config.store_path.clone());
//! let associations = Arc::new(AssociationManager::open(Box::new(store))?);
//!
//! let mut client = ProxyClient::connect(config, associations).await?;
//! let hash = client.get_database_hash(false).await?;
//! println!("open database: {}", hash);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod actions;
pub mod association;
pub mod client;
pub mod helpers;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use actions::{
    ConnectionKey, DatabaseGroups, GetLoginsRequest, Group, LoginEntry, NewGroup,
    SetLoginRequest, ValidLogin,
};
pub use association::{AssociationManager, AssociationRecord};
pub use client::ProxyClient;
pub use helpers::{default_socket_path, default_store_path, env_bool};
pub use session::{HandshakeState, Session};
pub use store::{AssociationStore, JsonFileStore, MemoryStore, StoredAssociation};
pub use transport::MessageStream;
pub use types::{AssociationState, ClientConfig, ProxyEvent, TestOutcome};
