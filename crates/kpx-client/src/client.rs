use kpx_common::helpers::{constant_time_eq, redact};
use kpx_common::protocol::{self, parse_error_code, FailureReply, Inbound, Signal};
use kpx_common::{Action, Error, ErrorCode, Result};
use kpx_crypto::nonce::nonce_to_base64;
use kpx_crypto::{EntropySource, Nonce, OsEntropy};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::actions::{
    generated_password, keys_value, ConnectionKey, DatabaseGroups, GetLoginsRequest, Group,
    LoginEntry, NewGroup, SetLoginRequest, ValidLogin,
};
use crate::association::AssociationManager;
use crate::session::{HandshakeState, Session};
use crate::transport::{self, MessageStream, ProxyStream};
use crate::types::{AssociationState, ClientConfig, ProxyEvent};

const EVENT_CAPACITY: usize = 16;

/// Client for one connection to the proxy.
///
/// Every call is a full round trip and takes `&mut self`; wrap the client in a
/// `tokio::sync::Mutex` to share it between tasks.
pub struct ProxyClient<S> {
    pub(crate) stream: MessageStream<S>,
    pub(crate) session: Session,
    pub(crate) associations: Arc<AssociationManager>,
    pub(crate) config: ClientConfig,
    pub(crate) entropy: Box<dyn EntropySource>,
    pub(crate) database_hash: Option<String>,
    pub(crate) association_state: AssociationState,
    /// Set once the stream can no longer be trusted to pair requests with replies.
    closed: bool,
    events: broadcast::Sender<ProxyEvent>,
}

impl ProxyClient<ProxyStream> {
    /// Open the configured endpoint and run the key exchange.
    pub async fn connect(config: ClientConfig, associations: Arc<AssociationManager>) -> Result<Self> {
        config.validate()?;
        let io = time::timeout(config.request_timeout, transport::connect(&config.socket_path))
            .await
            .map_err(|_| {
                Error::timeout(format!("connecting to {}", config.socket_path.display()))
            })??;

        let mut client = Self::new(io, config, associations);
        client.handshake().await?;
        Ok(client)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ProxyClient<S> {
    pub fn new(io: S, config: ClientConfig, associations: Arc<AssociationManager>) -> Self {
        Self::with_entropy(io, config, associations, Box::new(OsEntropy::default()))
    }

    /// Use the given randomness for session keys, nonces and identification keys.
    pub fn with_entropy(
        io: S,
        config: ClientConfig,
        associations: Arc<AssociationManager>,
        mut entropy: Box<dyn EntropySource>,
    ) -> Self {
        let session = Session::new(entropy.as_mut());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            stream: MessageStream::new(io),
            session,
            associations,
            config,
            entropy,
            database_hash: None,
            association_state: AssociationState::Unknown,
            closed: false,
            events,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn associations(&self) -> &Arc<AssociationManager> {
        &self.associations
    }

    /// Hash of the database last reported by the proxy on this connection.
    pub fn database_hash(&self) -> Option<&str> {
        self.database_hash.as_deref()
    }

    pub fn association_state(&self) -> AssociationState {
        self.association_state
    }

    /// Whether an earlier timeout or transport failure retired this connection.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    /// Retire the connection after an error that leaves a request unanswered
    /// or the stream broken.
    fn note_failure<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::Timeout(_) | Error::Transport(_) | Error::Disconnected) = &result {
            if !self.closed {
                warn!("connection to proxy closed after failed exchange");
            }
            self.closed = true;
        }
        result
    }

    /// Receive `database-locked` / `database-unlocked` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// Exchange session public keys with the proxy.
    pub async fn handshake(&mut self) -> Result<()> {
        self.ensure_open()?;
        let request = self.session.begin_handshake()?;
        let sent = self.stream.send(&request.encode()?).await;
        self.note_failure(sent)?;

        let wait = self.config.request_timeout;
        let received = self.recv_reply(Action::ChangePublicKeys, wait).await;
        match self.note_failure(received) {
            Ok(reply) => self.session.complete_handshake(reply),
            Err(err) => {
                self.session.reject();
                Err(match err {
                    Error::MalformedMessage(msg) | Error::Protocol(msg) => Error::handshake(msg),
                    other => other,
                })
            }
        }
    }

    fn timeout_for(&self, action: Action, trigger_unlock: bool) -> Duration {
        if trigger_unlock || action.prompts_user() {
            self.config.interactive_timeout
        } else {
            self.config.request_timeout
        }
    }

    fn handle_signal(&mut self, signal: Signal) -> ProxyEvent {
        let event = match signal {
            Signal::DatabaseLocked => {
                info!("database locked");
                ProxyEvent::DatabaseLocked
            }
            Signal::DatabaseUnlocked => {
                info!("database unlocked");
                ProxyEvent::DatabaseUnlocked
            }
        };
        // The open database may differ after either transition.
        self.database_hash = None;
        self.association_state = AssociationState::Unknown;

        let _ = self.events.send(event);
        event
    }

    /// Wait for the reply to `action`, dispatching signals that arrive first.
    async fn recv_reply(&mut self, action: Action, wait: Duration) -> Result<Inbound> {
        let deadline = Instant::now() + wait;
        loop {
            let text = time::timeout_at(deadline, self.stream.recv())
                .await
                .map_err(|_| Error::timeout(format!("no `{}` reply within {:?}", action, wait)))??;

            match protocol::decode(&text)? {
                Inbound::Signal(signal) => {
                    self.handle_signal(signal);
                }
                inbound if inbound.action() != action => {
                    return Err(Error::protocol(format!(
                        "expected `{}` reply, got `{}`",
                        action,
                        inbound.action()
                    )));
                }
                inbound => return Ok(inbound),
            }
        }
    }

    /// Wait for the next out-of-band event while no call is in flight.
    pub async fn next_event(&mut self) -> Result<ProxyEvent> {
        self.ensure_open()?;
        loop {
            let received = self.stream.recv().await;
            let text = self.note_failure(received)?;
            match protocol::decode(&text)? {
                Inbound::Signal(signal) => return Ok(self.handle_signal(signal)),
                other => warn!("ignoring unsolicited `{}` message", other.action()),
            }
        }
    }

    /// Send one encrypted request and return the decrypted reply object.
    ///
    /// A timeout or transport failure closes the client: the unanswered
    /// request would otherwise pair its late reply with the next call.
    pub(crate) async fn round_trip(
        &mut self,
        action: Action,
        fields: Map<String, Value>,
        trigger_unlock: bool,
    ) -> Result<Map<String, Value>> {
        self.ensure_open()?;
        let result = self.exchange(action, fields, trigger_unlock).await;
        self.note_failure(result)
    }

    async fn exchange(
        &mut self,
        action: Action,
        fields: Map<String, Value>,
        trigger_unlock: bool,
    ) -> Result<Map<String, Value>> {
        let sealed = self.session.seal(action, fields, trigger_unlock)?;
        self.stream.send(&sealed.envelope.encode()?).await?;

        let wait = self.timeout_for(action, trigger_unlock);
        let reply = match self.recv_reply(action, wait).await? {
            Inbound::Encrypted(reply) => reply,
            Inbound::Failure(failure) => {
                debug!(%action, code = %failure.code, "proxy error: {}", failure.message);
                return Err(failure.into_error());
            }
            other => {
                return Err(Error::protocol(format!(
                    "plaintext `{}` message in reply to `{}`",
                    other.action(),
                    action
                )))
            }
        };

        let body = self.session.open(&reply, &sealed.reply_nonce)?;
        check_reply(action, &sealed.reply_nonce, body)
    }

    /// Hash identifying the currently open database.
    pub async fn get_database_hash(&mut self, trigger_unlock: bool) -> Result<String> {
        let reply = self
            .round_trip(Action::GetDatabaseHash, Map::new(), trigger_unlock)
            .await?;
        let hash = str_field(&reply, "hash")?;

        if self.database_hash.as_deref() != Some(hash.as_str()) {
            debug!(hash = %redact(&hash), "current database changed");
            self.association_state = AssociationState::Unknown;
        }
        self.database_hash = Some(hash.clone());
        Ok(hash)
    }

    /// Ask the proxy's password generator for a new password.
    pub async fn generate_password(&mut self) -> Result<String> {
        let reply = self
            .round_trip(Action::GeneratePassword, Map::new(), false)
            .await?;
        generated_password(&reply)
            .ok_or_else(|| Error::protocol("`generate-password` reply carries no password"))
    }

    /// Entries matching a url. An empty list when nothing matches.
    pub async fn get_logins(&mut self, request: GetLoginsRequest) -> Result<Vec<LoginEntry>> {
        self.ensure_associated().await?;
        let fields = request.into_fields(self.associations.export_keys());

        match self.round_trip(Action::GetLogins, fields, false).await {
            Ok(reply) => match reply.get("entries") {
                Some(entries) => serde_json::from_value(entries.clone()).map_err(Error::malformed),
                None => Ok(Vec::new()),
            },
            Err(Error::Rejected {
                code: ErrorCode::NoLoginsFound,
                ..
            }) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Look for an entry for `url` with this password, and this login if given.
    pub async fn find_login(
        &mut self,
        url: &str,
        login: Option<&str>,
        password: &str,
    ) -> Result<ValidLogin> {
        let entries = self.get_logins(GetLoginsRequest::new(url)).await?;
        let found = entries.into_iter().find(|entry| {
            login.map_or(true, |l| entry.login == l)
                && constant_time_eq(entry.password.as_bytes(), password.as_bytes())
        });

        Ok(match found {
            Some(entry) => ValidLogin {
                found: true,
                uuid: Some(entry.uuid),
            },
            None => ValidLogin::default(),
        })
    }

    /// Create or update an entry. Returns the entry's uuid when known.
    pub async fn set_login(&mut self, request: SetLoginRequest) -> Result<Option<String>> {
        let record = self.ensure_associated().await?;
        let id = request
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or(record.name);
        let requested_uuid = request.uuid.clone();

        let reply = self
            .round_trip(Action::SetLogin, request.into_fields(id), false)
            .await?;
        Ok(reply
            .get("uuid")
            .and_then(Value::as_str)
            .filter(|uuid| !uuid.is_empty())
            .map(str::to_string)
            .or(requested_uuid))
    }

    /// Group tree of the current database.
    pub async fn get_database_groups(&mut self) -> Result<DatabaseGroups> {
        self.ensure_associated().await?;

        let reply = match self
            .round_trip(Action::GetDatabaseGroups, Map::new(), false)
            .await
        {
            Ok(reply) => reply,
            Err(Error::Rejected {
                code: ErrorCode::NoGroupsFound,
                ..
            }) => return Ok(DatabaseGroups::default()),
            Err(err) => return Err(err),
        };

        let groups = match reply.get("groups").and_then(|g| g.get("groups")) {
            Some(groups) => serde_json::from_value::<Vec<Group>>(groups.clone())
                .map_err(Error::malformed)?,
            None => Vec::new(),
        };
        Ok(DatabaseGroups { groups })
    }

    /// Create a group by name or `parent/child` path. Existing groups are kept.
    pub async fn create_new_group(&mut self, name: &str) -> Result<NewGroup> {
        self.ensure_associated().await?;

        let mut fields = Map::new();
        fields.insert("groupName".into(), Value::from(name));
        let reply = self
            .round_trip(Action::CreateNewGroup, fields, false)
            .await?;

        Ok(NewGroup {
            name: str_field(&reply, "name")?,
            uuid: str_field(&reply, "uuid")?,
        })
    }

    /// Current TOTP for an entry; empty when the entry has none.
    pub async fn get_totp(&mut self, uuid: &str) -> Result<String> {
        self.ensure_associated().await?;

        let mut fields = Map::new();
        fields.insert("uuid".into(), Value::from(uuid));
        let reply = self.round_trip(Action::GetTotp, fields, false).await?;
        Ok(reply
            .get("totp")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn delete_entry(&mut self, uuid: &str) -> Result<()> {
        self.ensure_associated().await?;

        let mut fields = Map::new();
        fields.insert("uuid".into(), Value::from(uuid));
        self.round_trip(Action::DeleteEntry, fields, false).await?;
        Ok(())
    }

    /// Ask the password manager to run global auto-type for `search`.
    pub async fn request_autotype(&mut self, search: &str) -> Result<()> {
        self.ensure_associated().await?;

        let mut fields = Map::new();
        fields.insert("search".into(), Value::from(search));
        self.round_trip(Action::RequestAutotype, fields, false).await?;
        Ok(())
    }

    /// Lock the current database.
    ///
    /// The proxy answers a successful lock with "database not opened", so
    /// that reply counts as success, as does a database that was already
    /// closed.
    pub async fn lock_database(&mut self) -> Result<()> {
        let result = self
            .round_trip(Action::LockDatabase, Map::new(), false)
            .await;
        match result {
            Ok(_)
            | Err(Error::DatabaseLocked)
            | Err(Error::Rejected {
                code: ErrorCode::DatabaseHashNotReceived,
                ..
            }) => {
                self.database_hash = None;
                self.association_state = AssociationState::Unknown;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Register a WebAuthn credential. `public_key` is the
    /// `PublicKeyCredentialCreationOptions` object.
    pub async fn passkeys_register(&mut self, public_key: Value, origin: &str) -> Result<Value> {
        self.passkeys(Action::PasskeysRegister, public_key, origin).await
    }

    /// Get a WebAuthn assertion. `public_key` is the
    /// `PublicKeyCredentialRequestOptions` object.
    pub async fn passkeys_get(&mut self, public_key: Value, origin: &str) -> Result<Value> {
        self.passkeys(Action::PasskeysGet, public_key, origin).await
    }

    async fn passkeys(&mut self, action: Action, public_key: Value, origin: &str) -> Result<Value> {
        self.ensure_associated().await?;

        let mut fields = Map::new();
        fields.insert("publicKey".into(), public_key);
        fields.insert("origin".into(), Value::from(origin));
        fields.insert("keys".into(), keys_value(self.associations.export_keys()));

        let mut reply = self.round_trip(action, fields, false).await?;
        reply
            .remove("response")
            .ok_or_else(|| Error::protocol(format!("`{}` reply carries no response", action)))
    }

    /// `{id, key}` of the association for the current database, if any.
    pub fn export_connection(&self) -> Option<ConnectionKey> {
        let hash = self.database_hash.as_deref()?;
        self.associations
            .lookup(hash)
            .map(|record| record.connection_key())
    }

    /// Whether the key exchange completed on this connection.
    pub fn is_established(&self) -> bool {
        self.session.state() == HandshakeState::Established
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

pub(crate) fn str_field(reply: &Map<String, Value>, key: &str) -> Result<String> {
    reply
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::protocol(format!("reply lacks `{}`", key)))
}

/// Validate a decrypted reply against the request it answers.
fn check_reply(
    action: Action,
    reply_nonce: &Nonce,
    body: Map<String, Value>,
) -> Result<Map<String, Value>> {
    if let Some(inner) = body.get("action") {
        if inner.as_str() != Some(action.as_str()) {
            return Err(Error::protocol(format!(
                "`{}` reply names action {}",
                action, inner
            )));
        }
    }
    if let Some(inner) = body.get("nonce") {
        if inner.as_str() != Some(nonce_to_base64(reply_nonce).as_str()) {
            return Err(Error::protocol(format!(
                "`{}` reply carries a foreign nonce",
                action
            )));
        }
    }

    // Successful replies may still carry `"error": "success"`.
    if body.get("success").is_some_and(protocol::is_truthy) {
        return Ok(body);
    }

    if body.contains_key("error") || body.contains_key("errorCode") {
        let code = match body.get("errorCode") {
            Some(value) => parse_error_code(value)?,
            None => ErrorCode::Other(0),
        };
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(FailureReply {
            action,
            code,
            message,
        }
        .into_error());
    }

    Err(Error::protocol(format!(
        "`{}` reply does not report success",
        action
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_check_reply_accepts_matching_reply() {
        let nonce = [1u8; 24];
        let reply = body(json!({
            "action": "get-totp",
            "nonce": nonce_to_base64(&nonce),
            "totp": "000111",
            "success": "true",
        }));
        let checked = check_reply(Action::GetTotp, &nonce, reply).unwrap();
        assert_eq!(checked["totp"], "000111");
    }

    #[test]
    fn test_check_reply_rejects_other_action() {
        let reply = body(json!({"action": "get-logins", "success": "true"}));
        assert!(matches!(
            check_reply(Action::GetTotp, &[0u8; 24], reply),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_check_reply_rejects_foreign_nonce() {
        let reply = body(json!({"nonce": nonce_to_base64(&[9u8; 24]), "success": "true"}));
        assert!(matches!(
            check_reply(Action::GetTotp, &[0u8; 24], reply),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_check_reply_maps_inner_error() {
        let reply = body(json!({"error": "Database not opened", "errorCode": "1"}));
        assert!(matches!(
            check_reply(Action::GetLogins, &[0u8; 24], reply),
            Err(Error::DatabaseLocked)
        ));
    }

    #[test]
    fn test_check_reply_tolerates_success_error_field() {
        let reply = body(json!({"action": "set-login", "error": "success", "success": "true"}));
        assert!(check_reply(Action::SetLogin, &[0u8; 24], reply).is_ok());
    }

    #[test]
    fn test_check_reply_requires_success() {
        let reply = body(json!({"action": "delete-entry", "success": "false"}));
        assert!(matches!(
            check_reply(Action::DeleteEntry, &[0u8; 24], reply),
            Err(Error::Protocol(_))
        ));
    }
}
