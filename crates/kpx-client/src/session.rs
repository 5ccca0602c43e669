//! Per-connection encrypted session.
//!
//! A [`Session`] owns the ephemeral key pair, the proxy's public key once the
//! key exchange completed, and the nonce sequencer. It never touches the
//! transport: the client feeds it replies and sends what it produces.
//!
//! # Handshake
//!
//! ```text
//! Idle --begin_handshake--> KeysSent --complete_handshake--> Established
//!                                    \------------------------> Rejected
//! ```
//!
//! `Established` and `Rejected` are terminal. A new connection needs a new
//! session.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kpx_common::helpers::{constant_time_eq, key_fingerprint};
use kpx_common::protocol::{EncryptedReply, Inbound, Outbound};
use kpx_common::{Action, Error, Result};
use kpx_crypto::entropy::random_bytes;
use kpx_crypto::nonce::{increment, nonce_to_base64};
use kpx_crypto::{decrypt, encrypt, EntropySource, KeyPair, Nonce, NonceSequencer, PublicKey};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, info, trace, warn};

/// Random bytes in a generated client id.
const CLIENT_ID_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    KeysSent,
    Established,
    Rejected,
}

/// A request ready for the wire, plus the nonce its reply must carry.
#[derive(Debug, Clone)]
pub struct SealedRequest {
    pub envelope: Outbound,
    pub reply_nonce: Nonce,
}

pub struct Session {
    client_id: String,
    keys: KeyPair,
    peer: Option<PublicKey>,
    state: HandshakeState,
    nonces: NonceSequencer,
    pending_reply: Option<Nonce>,
    proxy_version: Option<String>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("public", self.keys.public())
            .field("peer", &self.peer)
            .field("proxy_version", &self.proxy_version)
            .finish()
    }
}

impl Session {
    /// Fresh session with a random client id.
    pub fn new(entropy: &mut dyn EntropySource) -> Self {
        let client_id = STANDARD.encode(random_bytes::<CLIENT_ID_SIZE>(entropy));
        Self::with_client_id(client_id, entropy)
    }

    pub fn with_client_id(client_id: impl Into<String>, entropy: &mut dyn EntropySource) -> Self {
        Self {
            client_id: client_id.into(),
            keys: KeyPair::generate(entropy),
            peer: None,
            state: HandshakeState::Idle,
            nonces: NonceSequencer::random(entropy),
            pending_reply: None,
            proxy_version: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Our ephemeral public key.
    pub fn public_key(&self) -> &PublicKey {
        self.keys.public()
    }

    /// The proxy's ephemeral public key, once established.
    pub fn peer_key(&self) -> Option<&PublicKey> {
        self.peer.as_ref()
    }

    pub fn proxy_version(&self) -> Option<&str> {
        self.proxy_version.as_deref()
    }

    /// Nonces consumed so far, replies included.
    pub fn nonces_issued(&self) -> u64 {
        self.nonces.issued()
    }

    /// Fail unless encrypted traffic is allowed.
    pub fn ensure_established(&self) -> Result<()> {
        match self.state {
            HandshakeState::Established => Ok(()),
            HandshakeState::Rejected => {
                Err(Error::handshake("key exchange was rejected; reconnect"))
            }
            HandshakeState::Idle | HandshakeState::KeysSent => Err(Error::NotEstablished),
        }
    }

    /// Reserve a request nonce and the reply nonce that follows it.
    fn reserve_exchange(&mut self) -> Result<(Nonce, Nonce)> {
        let request = self.nonces.next()?;
        let reply = self.nonces.next()?;
        debug_assert_eq!(increment(&request), Some(reply));
        Ok((request, reply))
    }

    /// Build the plaintext `change-public-keys` request. `Idle -> KeysSent`.
    pub fn begin_handshake(&mut self) -> Result<Outbound> {
        if self.state != HandshakeState::Idle {
            return Err(Error::protocol(format!(
                "key exchange already started ({:?})",
                self.state
            )));
        }

        let (nonce, reply) = self.reserve_exchange()?;
        self.pending_reply = Some(reply);
        self.state = HandshakeState::KeysSent;

        debug!(
            key = %key_fingerprint(self.keys.public()),
            "sending session public key"
        );

        Ok(Outbound::KeyExchange {
            public_key: *self.keys.public(),
            nonce,
            client_id: self.client_id.clone(),
        })
    }

    /// Consume the proxy's answer to the key exchange.
    ///
    /// Any answer other than a well-formed successful reply rejects the session.
    pub fn complete_handshake(&mut self, reply: Inbound) -> Result<()> {
        if self.state != HandshakeState::KeysSent {
            return Err(Error::protocol(format!(
                "no key exchange in progress ({:?})",
                self.state
            )));
        }
        let expected_nonce = self.pending_reply.take();

        match self.accept_key_exchange(reply, expected_nonce) {
            Ok((peer, version)) => {
                info!(
                    proxy_key = %key_fingerprint(&peer),
                    version = version.as_deref().unwrap_or("unknown"),
                    "session established"
                );
                self.peer = Some(peer);
                self.proxy_version = version;
                self.state = HandshakeState::Established;
                Ok(())
            }
            Err(err) => {
                warn!("key exchange rejected: {}", err);
                self.state = HandshakeState::Rejected;
                Err(err)
            }
        }
    }

    /// Abandon a key exchange that got no usable answer.
    pub fn reject(&mut self) {
        if self.state != HandshakeState::Established {
            self.pending_reply = None;
            self.state = HandshakeState::Rejected;
        }
    }

    fn accept_key_exchange(
        &self,
        reply: Inbound,
        expected_nonce: Option<Nonce>,
    ) -> Result<(PublicKey, Option<String>)> {
        let reply = match reply {
            Inbound::KeyExchange(reply) => reply,
            Inbound::Failure(failure) => {
                return Err(Error::handshake(format!(
                    "proxy error {}: {}",
                    failure.code, failure.message
                )))
            }
            other => {
                return Err(Error::handshake(format!(
                    "unexpected `{}` reply to key exchange",
                    other.action()
                )))
            }
        };

        if !reply.success {
            return Err(Error::handshake("proxy refused the key exchange"));
        }
        if let Some(expected) = expected_nonce {
            if !constant_time_eq(&reply.nonce, &expected) {
                return Err(Error::handshake("reply nonce does not follow request nonce"));
            }
        }
        let key = reply
            .public_key
            .ok_or_else(|| Error::handshake("reply carries no public key"))?;
        let peer = PublicKey::from_slice(&key).map_err(Error::handshake)?;
        if constant_time_eq(peer.as_bytes(), self.keys.public().as_bytes()) {
            return Err(Error::handshake("proxy echoed our own public key"));
        }

        Ok((peer, reply.version))
    }

    /// Encrypt an action request.
    ///
    /// `fields` is the action-specific payload; `action`, `nonce` and
    /// `clientID` are added here.
    pub fn seal(
        &mut self,
        action: Action,
        mut fields: Map<String, Value>,
        trigger_unlock: bool,
    ) -> Result<SealedRequest> {
        self.ensure_established()?;
        let peer = self.peer.ok_or(Error::NotEstablished)?;

        let (nonce, reply_nonce) = self.reserve_exchange()?;
        fields.insert("action".into(), Value::from(action.as_str()));
        fields.insert("nonce".into(), Value::from(nonce_to_base64(&nonce)));
        fields.insert("clientID".into(), Value::from(self.client_id.as_str()));

        let plaintext = serde_json::to_vec(&Value::Object(fields))?;
        trace!(%action, payload = %String::from_utf8_lossy(&plaintext), "sealing");
        let message = encrypt(&plaintext, &nonce, &peer, &self.keys)?;

        Ok(SealedRequest {
            envelope: Outbound::Encrypted {
                action,
                message,
                nonce,
                client_id: self.client_id.clone(),
                trigger_unlock,
            },
            reply_nonce,
        })
    }

    /// Authenticate and decrypt a reply into its JSON object.
    ///
    /// Nothing is returned unless the nonce matches and the tag verifies.
    pub fn open(&self, reply: &EncryptedReply, expected_nonce: &Nonce) -> Result<Map<String, Value>> {
        self.ensure_established()?;
        let peer = self.peer.as_ref().ok_or(Error::NotEstablished)?;

        if !constant_time_eq(&reply.nonce, expected_nonce) {
            return Err(Error::protocol(format!(
                "`{}` reply nonce does not follow request nonce",
                reply.action
            )));
        }

        let plaintext = decrypt(&reply.message, &reply.nonce, peer, &self.keys)?;
        trace!(action = %reply.action, payload = %String::from_utf8_lossy(&plaintext), "opened");

        match serde_json::from_slice::<Value>(&plaintext)? {
            Value::Object(map) => Ok(map),
            _ => Err(Error::malformed("decrypted payload is not a JSON object")),
        }
    }
}
