//! Associations between this client and password databases.
//!
//! An association is created once, when the user approves it in the password
//! manager, and bound to a long-lived identification key. On every new
//! connection the proxy may have restarted, so a stored record is re-validated
//! with `test-associate` before any privileged action uses it.

use kpx_common::helpers::redact;
use kpx_common::{Action, Error, Result};
use kpx_crypto::KeyPair;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::actions::ConnectionKey;
use crate::client::{str_field, ProxyClient};
use crate::store::{AssociationStore, MemoryStore, StoredAssociation};
use crate::types::{AssociationState, TestOutcome};

#[derive(Clone, PartialEq, Eq)]
pub struct AssociationRecord {
    /// Database hash reported by the proxy.
    pub database_id: String,
    /// Association name the user entered in the proxy's dialog.
    pub name: String,
    pub id_key: KeyPair,
}

impl fmt::Debug for AssociationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationRecord")
            .field("database_id", &redact(&self.database_id))
            .field("name", &self.name)
            .field("id_key", self.id_key.public())
            .finish()
    }
}

impl AssociationRecord {
    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey {
            id: self.name.clone(),
            key: self.id_key.public().to_base64(),
        }
    }

    fn to_stored(&self) -> StoredAssociation {
        StoredAssociation {
            database_id: self.database_id.clone(),
            name: self.name.clone(),
            id_key: self.id_key.secret_base64().to_string(),
        }
    }

    fn from_stored(stored: StoredAssociation) -> Result<Self> {
        let id_key = KeyPair::from_secret_base64(&stored.id_key).map_err(|e| {
            Error::store(format!(
                "association `{}` has a bad identification key: {}",
                stored.name, e
            ))
        })?;
        Ok(Self {
            database_id: stored.database_id,
            name: stored.name,
            id_key,
        })
    }
}

/// Association records, keyed by database hash.
///
/// Lookups run concurrently; a write holds the lock until the store has
/// persisted it.
pub struct AssociationManager {
    records: RwLock<BTreeMap<String, AssociationRecord>>,
    store: Box<dyn AssociationStore>,
}

impl fmt::Debug for AssociationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationManager")
            .field("records", &self.len())
            .finish()
    }
}

impl AssociationManager {
    /// Load every record from `store`.
    pub fn open(store: Box<dyn AssociationStore>) -> Result<Self> {
        let mut records = BTreeMap::new();
        for stored in store.load()? {
            let record = AssociationRecord::from_stored(stored)?;
            records.insert(record.database_id.clone(), record);
        }
        debug!(count = records.len(), "association records loaded");

        Ok(Self {
            records: RwLock::new(records),
            store,
        })
    }

    /// Manager backed by a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            store: Box::new(MemoryStore::new()),
        }
    }

    pub fn lookup(&self, database_id: &str) -> Option<AssociationRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(database_id)
            .cloned()
    }

    pub fn records(&self) -> Vec<AssociationRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `{id, key}` of every association, as sent with `get-logins`.
    pub fn export_keys(&self) -> Vec<ConnectionKey> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(AssociationRecord::connection_key)
            .collect()
    }

    /// Store a record, replacing any previous one for the same database.
    pub fn insert(&self, record: AssociationRecord) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let previous = records.insert(record.database_id.clone(), record.clone());

        if let Err(err) = self.persist(&records) {
            match previous {
                Some(previous) => records.insert(record.database_id.clone(), previous),
                None => records.remove(&record.database_id),
            };
            return Err(err);
        }
        Ok(())
    }

    /// Drop the record for a database. Returns whether one existed.
    pub fn evict(&self, database_id: &str) -> Result<bool> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let Some(previous) = records.remove(database_id) else {
            return Ok(false);
        };

        if let Err(err) = self.persist(&records) {
            records.insert(database_id.to_string(), previous);
            return Err(err);
        }
        info!(database = %redact(database_id), "association evicted");
        Ok(true)
    }

    fn persist(&self, records: &BTreeMap<String, AssociationRecord>) -> Result<()> {
        let stored: Vec<StoredAssociation> =
            records.values().map(AssociationRecord::to_stored).collect();
        self.store.save(&stored)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ProxyClient<S> {
    /// Ask the user to associate this client with the open database.
    ///
    /// Nothing is stored unless the user approves.
    pub async fn associate(&mut self) -> Result<AssociationRecord> {
        self.session.ensure_established()?;
        let id_key = KeyPair::generate(self.entropy.as_mut());

        let mut fields = Map::new();
        fields.insert(
            "key".into(),
            Value::from(self.session.public_key().to_base64()),
        );
        fields.insert("idKey".into(), Value::from(id_key.public().to_base64()));

        let reply = match self.round_trip(Action::Associate, fields, false).await {
            Ok(reply) => reply,
            Err(Error::Timeout(msg)) => {
                return Err(Error::AssociationDenied(format!("no answer: {}", msg)))
            }
            Err(err) => return Err(err),
        };

        let record = AssociationRecord {
            database_id: str_field(&reply, "hash")?,
            name: str_field(&reply, "id")?,
            id_key,
        };
        self.associations.insert(record.clone())?;
        info!(
            name = %record.name,
            database = %redact(&record.database_id),
            "associated"
        );

        self.database_hash = Some(record.database_id.clone());
        self.association_state = AssociationState::Validated;
        Ok(record)
    }

    /// Check that the proxy still accepts `record`.
    ///
    /// Only a refused identity counts as `Invalid`. A locked database and any
    /// other proxy error propagate unchanged, so the record is never evicted
    /// for them.
    pub async fn test_associate(&mut self, record: &AssociationRecord) -> Result<TestOutcome> {
        self.session.ensure_established()?;

        let mut fields = Map::new();
        fields.insert("id".into(), Value::from(record.name.as_str()));
        fields.insert("key".into(), Value::from(record.id_key.public().to_base64()));

        let reply = match self.round_trip(Action::TestAssociate, fields, false).await {
            Ok(reply) => reply,
            Err(Error::NotAssociated(_)) => {
                warn!(name = %record.name, "association rejected by proxy");
                return Ok(TestOutcome::Invalid);
            }
            Err(err) => return Err(err),
        };

        if let Some(id) = reply.get("id").and_then(Value::as_str) {
            if id != record.name {
                warn!(name = %record.name, reported = %id, "proxy confirmed a different association");
                return Ok(TestOutcome::Invalid);
            }
        }
        if let Some(hash) = reply.get("hash").and_then(Value::as_str) {
            self.database_hash = Some(hash.to_string());
            if hash != record.database_id {
                warn!(
                    name = %record.name,
                    reported = %redact(hash),
                    "association belongs to a different database"
                );
                self.association_state = AssociationState::Unknown;
                return Ok(TestOutcome::Invalid);
            }
        }
        if self.database_hash.as_deref() == Some(record.database_id.as_str()) {
            self.association_state = AssociationState::Validated;
        }

        debug!(name = %record.name, "association valid");
        Ok(TestOutcome::Valid)
    }

    /// `test-associate` for the stored record of a database.
    pub async fn test_association(&mut self, database_id: &str) -> Result<TestOutcome> {
        self.session.ensure_established()?;
        match self.associations.lookup(database_id) {
            Some(record) => self.test_associate(&record).await,
            None => Ok(TestOutcome::NotFound),
        }
    }

    /// Make sure the open database has an association validated on this
    /// connection, evicting records the proxy no longer accepts.
    pub async fn ensure_associated(&mut self) -> Result<AssociationRecord> {
        self.session.ensure_established()?;

        let hash = match self.database_hash.clone() {
            Some(hash) => hash,
            None => {
                let trigger_unlock = self.config.trigger_unlock;
                self.get_database_hash(trigger_unlock).await?
            }
        };

        let Some(record) = self.associations.lookup(&hash) else {
            self.association_state = AssociationState::NotAssociated;
            return Err(Error::NotAssociated(format!(
                "no association for database {}",
                redact(&hash)
            )));
        };

        if self.association_state == AssociationState::Validated {
            return Ok(record);
        }

        match self.test_associate(&record).await? {
            TestOutcome::Valid => {
                self.association_state = AssociationState::Validated;
                Ok(record)
            }
            TestOutcome::Invalid | TestOutcome::NotFound
                if self.database_hash.as_deref() != Some(hash.as_str()) =>
            {
                // Another database was opened while checking; the record may still be good.
                Err(Error::NotAssociated(format!(
                    "database changed while validating `{}`",
                    record.name
                )))
            }
            TestOutcome::Invalid | TestOutcome::NotFound => {
                self.associations.evict(&hash)?;
                self.association_state = AssociationState::NotAssociated;
                Err(Error::NotAssociated(format!(
                    "association `{}` is no longer accepted",
                    record.name
                )))
            }
        }
    }
}
