//! In-process stand-in for the password manager's browser proxy.

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kpx_client::{AssociationManager, ClientConfig, MessageStream, ProxyClient};
use kpx_crypto::nonce::{increment, nonce_from_base64, nonce_to_base64};
use kpx_crypto::{decrypt, encrypt, KeyPair, Nonce, PublicKey};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, DuplexStream};
use tokio::task::JoinHandle;

pub const DATABASE_HASH: &str = "abc123def456abc123def456abc123def456abc123def456abc123def456abcd";

/// Proxy-side state shared across connections, like a running password manager.
#[derive(Debug)]
pub struct SimState {
    pub database_hash: String,
    pub locked: bool,
    pub approve_associations: bool,
    pub handshake_success: bool,
    /// Association name -> identification public key.
    pub associations: HashMap<String, String>,
    pub association_prompts: usize,
    pub entries: Vec<Value>,
    /// Requests seen, in order.
    pub requests: Vec<String>,
    /// Answer the next request under this outer action name.
    pub outer_action_override: Option<String>,
    /// Put this action name inside the next encrypted reply.
    pub inner_action_override: Option<String>,
    /// Push this signal before answering the next request.
    pub signal_before_reply: Option<&'static str>,
    /// Swallow the next request without answering.
    pub drop_next_reply: bool,
    /// Hold the next reply back this long before sending it.
    pub delay_next_reply: Option<Duration>,
    /// Answer the next request for this action with this error code.
    pub fail_next: Option<(&'static str, i64)>,
    /// Report this database hash in `test-associate` replies.
    pub test_associate_hash: Option<String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            database_hash: DATABASE_HASH.to_string(),
            locked: false,
            approve_associations: true,
            handshake_success: true,
            associations: HashMap::new(),
            association_prompts: 0,
            entries: Vec::new(),
            requests: Vec::new(),
            outer_action_override: None,
            inner_action_override: None,
            signal_before_reply: None,
            drop_next_reply: false,
            delay_next_reply: None,
            fail_next: None,
            test_associate_hash: None,
        }
    }
}

pub type SharedState = Arc<Mutex<SimState>>;

pub fn shared_state() -> SharedState {
    Arc::new(Mutex::new(SimState::default()))
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        request_timeout: Duration::from_secs(2),
        interactive_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

/// Connect a client to a fresh simulator task. The key exchange is not run.
pub fn connect(
    state: SharedState,
    associations: Arc<AssociationManager>,
    seed: u64,
) -> (ProxyClient<DuplexStream>, JoinHandle<()>) {
    let (client_io, proxy_io) = duplex(64 * 1024);
    let proxy = tokio::spawn(run_proxy(proxy_io, state, seed.wrapping_add(1000)));
    let client = ProxyClient::with_entropy(
        client_io,
        test_config(),
        associations,
        Box::new(StdRng::seed_from_u64(seed)),
    );
    (client, proxy)
}

/// Connect and complete the key exchange.
pub async fn connect_established(
    state: SharedState,
    associations: Arc<AssociationManager>,
    seed: u64,
) -> (ProxyClient<DuplexStream>, JoinHandle<()>) {
    let (mut client, proxy) = connect(state, associations, seed);
    client.handshake().await.expect("handshake");
    (client, proxy)
}

struct Conn {
    stream: MessageStream<DuplexStream>,
    keys: KeyPair,
    client_key: Option<PublicKey>,
    client_id: Option<String>,
}

impl Conn {
    async fn send(&mut self, value: Value) {
        let _ = self.stream.send(&value.to_string()).await;
    }

    async fn send_error(&mut self, action: &str, code: i64, message: &str) {
        self.send(json!({
            "action": action,
            "error": message,
            "errorCode": code.to_string(),
        }))
        .await;
    }

    async fn send_encrypted(&mut self, action: &str, reply_nonce: &Nonce, body: Value) {
        let Some(client_key) = self.client_key else {
            return;
        };
        let plaintext = body.to_string();
        let message = encrypt(plaintext.as_bytes(), reply_nonce, &client_key, &self.keys)
            .expect("proxy encrypt");
        self.send(json!({
            "action": action,
            "message": STANDARD.encode(message),
            "nonce": nonce_to_base64(reply_nonce),
        }))
        .await;
    }
}

async fn run_proxy(io: DuplexStream, state: SharedState, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut conn = Conn {
        stream: MessageStream::new(io),
        keys: KeyPair::generate(&mut rng),
        client_key: None,
        client_id: None,
    };

    while let Ok(text) = conn.stream.recv().await {
        let request: Value = serde_json::from_str(&text).expect("client sent JSON");
        let action = request["action"].as_str().unwrap_or_default().to_string();
        let nonce = nonce_from_base64(request["nonce"].as_str().unwrap_or_default())
            .expect("client nonce");
        let reply_nonce = increment(&nonce).expect("nonce space");

        if action == "change-public-keys" {
            let success = state.lock().unwrap().handshake_success;
            conn.client_key = request["publicKey"]
                .as_str()
                .and_then(|k| PublicKey::from_base64(k).ok());
            conn.client_id = request["clientID"].as_str().map(str::to_string);
            let reply = json!({
                "action": "change-public-keys",
                "publicKey": conn.keys.public().to_base64(),
                "success": if success { "true" } else { "false" },
                "version": "2.7.6",
                "nonce": nonce_to_base64(&reply_nonce),
            });
            conn.send(reply).await;
            continue;
        }

        let Some(client_key) = conn.client_key else {
            conn.send_error(&action, 3, "Client public key not received").await;
            continue;
        };
        let ciphertext = STANDARD
            .decode(request["message"].as_str().unwrap_or_default())
            .unwrap_or_default();
        let Ok(plaintext) = decrypt(&ciphertext, &nonce, &client_key, &conn.keys) else {
            conn.send_error(&action, 4, "Cannot decrypt message").await;
            continue;
        };
        let inner: Map<String, Value> = serde_json::from_slice(&plaintext).expect("inner JSON");

        // Request framing contract.
        assert_eq!(inner["action"], action.as_str());
        assert_eq!(inner["nonce"], request["nonce"]);
        assert_eq!(inner["clientID"].as_str(), conn.client_id.as_deref());
        assert_eq!(request["clientID"].as_str(), conn.client_id.as_deref());

        let (signal, outer_override, inner_override, drop_reply, delay, fail) = {
            let mut st = state.lock().unwrap();
            st.requests.push(action.clone());
            let fail = match st.fail_next {
                Some((target, code)) if target == action => {
                    st.fail_next = None;
                    Some(code)
                }
                _ => None,
            };
            (
                st.signal_before_reply.take(),
                st.outer_action_override.take(),
                st.inner_action_override.take(),
                std::mem::take(&mut st.drop_next_reply),
                st.delay_next_reply.take(),
                fail,
            )
        };

        if drop_reply {
            continue;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(signal) = signal {
            conn.send(json!({ "action": signal })).await;
        }

        let unlock = request.get("triggerUnlock").and_then(Value::as_str) == Some("true");
        let outcome = match fail {
            Some(code) => Err(Reply::Error(code, "Injected failure")),
            None => handle(&state, &action, &inner, unlock, &mut rng),
        };

        match outcome {
            Ok(mut body) => {
                let outer = outer_override.unwrap_or_else(|| action.clone());
                body.insert(
                    "action".into(),
                    Value::from(inner_override.unwrap_or_else(|| action.clone())),
                );
                body.insert("nonce".into(), Value::from(nonce_to_base64(&reply_nonce)));
                body.insert("success".into(), Value::from("true"));
                conn.send_encrypted(&outer, &reply_nonce, Value::Object(body))
                    .await;
            }
            Err(Reply::Error(code, message)) => {
                conn.send_error(&action, code, message).await;
            }
            Err(Reply::ErrorAfterSignal(signal, code, message)) => {
                conn.send(json!({ "action": signal })).await;
                conn.send_error(&action, code, message).await;
            }
        }
    }
}

enum Reply {
    Error(i64, &'static str),
    ErrorAfterSignal(&'static str, i64, &'static str),
}

fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn handle(
    state: &SharedState,
    action: &str,
    inner: &Map<String, Value>,
    unlock: bool,
    rng: &mut StdRng,
) -> Result<Map<String, Value>, Reply> {
    let mut st = state.lock().unwrap();
    if st.locked && unlock {
        st.locked = false;
    }
    let field = |name: &str| inner.get(name).and_then(Value::as_str).unwrap_or_default().to_string();

    match action {
        "get-databasehash" => {
            if st.locked {
                return Err(Reply::Error(1, "Database not opened"));
            }
            Ok(obj(json!({ "hash": st.database_hash, "version": "2.7.6" })))
        }
        "associate" => {
            st.association_prompts += 1;
            if st.locked {
                return Err(Reply::Error(1, "Database not opened"));
            }
            if !st.approve_associations {
                return Err(Reply::Error(6, "Action cancelled or denied"));
            }
            assert!(!field("key").is_empty(), "associate without session key");
            let name = format!("kpx-sim-{}", st.association_prompts);
            st.associations.insert(name.clone(), field("idKey"));
            Ok(obj(json!({ "hash": st.database_hash, "id": name })))
        }
        "test-associate" => {
            if st.locked {
                return Err(Reply::Error(1, "Database not opened"));
            }
            let id = field("id");
            match st.associations.get(&id) {
                Some(key) if *key == field("key") => {
                    let hash = st
                        .test_associate_hash
                        .clone()
                        .unwrap_or_else(|| st.database_hash.clone());
                    Ok(obj(json!({ "hash": hash, "id": id })))
                }
                _ => Err(Reply::Error(8, "Association failed")),
            }
        }
        "get-logins" => {
            if st.locked {
                return Err(Reply::Error(1, "Database not opened"));
            }
            let url = field("url");
            let entries: Vec<Value> = st
                .entries
                .iter()
                .filter(|e| e["url"] == url.as_str())
                .map(|e| {
                    json!({
                        "login": e["login"],
                        "name": e["name"],
                        "password": e["password"],
                        "uuid": e["uuid"],
                        "group": e["group"],
                    })
                })
                .collect();
            if entries.is_empty() {
                return Err(Reply::Error(15, "No logins found"));
            }
            Ok(obj(json!({
                "count": entries.len().to_string(),
                "entries": entries,
                "hash": st.database_hash,
                "id": "",
            })))
        }
        "set-login" => {
            let uuid = match inner.get("uuid").and_then(Value::as_str) {
                Some(uuid) => uuid.to_string(),
                None => {
                    let mut bytes = [0u8; 16];
                    rand::RngCore::fill_bytes(rng, &mut bytes);
                    bytes.iter().map(|b| format!("{:02x}", b)).collect()
                }
            };
            st.entries.retain(|e| e["uuid"] != uuid.as_str());
            let entry = json!({
                "url": field("url"),
                "login": field("login"),
                "name": field("url"),
                "password": field("password"),
                "uuid": uuid,
                "group": field("group"),
            });
            st.entries.push(entry);
            Ok(obj(json!({
                "count": null,
                "entries": null,
                "error": "success",
                "hash": st.database_hash,
                "uuid": uuid,
            })))
        }
        "get-database-groups" => Ok(obj(json!({
            "groups": {
                "groups": [
                    {"name": "Root", "uuid": "root-uuid", "children": [
                        {"name": "Email", "uuid": "email-uuid", "children": []},
                        {"name": "Web", "uuid": "web-uuid", "children": [
                            {"name": "Shops", "uuid": "shops-uuid", "children": []}
                        ]}
                    ]}
                ]
            }
        }))),
        "generate-password" => Ok(obj(json!({
            "entries": [{"login": 128, "password": "G3n3rated-P4ssw0rd"}]
        }))),
        "lock-database" => {
            st.locked = true;
            Err(Reply::ErrorAfterSignal(
                "database-locked",
                1,
                "Database not opened",
            ))
        }
        "create-new-group" => {
            let name = field("groupName");
            let last = name.rsplit('/').next().unwrap_or_default().to_string();
            Ok(obj(json!({ "name": last, "uuid": format!("{}-uuid", last.to_lowercase()) })))
        }
        "get-totp" => Ok(obj(json!({ "totp": "287082" }))),
        "delete-entry" => {
            let uuid = field("uuid");
            let before = st.entries.len();
            st.entries.retain(|e| e["uuid"] != uuid.as_str());
            if st.entries.len() == before {
                return Err(Reply::Error(18, "No valid UUID provided"));
            }
            Ok(Map::new())
        }
        "request-autotype" => Ok(Map::new()),
        "passkeys-register" | "passkeys-get" => Ok(obj(json!({
            "response": {"type": "public-key", "origin": field("origin")}
        }))),
        _ => Err(Reply::Error(12, "Incorrect action")),
    }
}
