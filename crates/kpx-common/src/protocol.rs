//! Wire protocol of the browser proxy.
//!
//! Every message is one JSON object. The `action` field names the request and
//! decides which shape the rest of the object has:
//!
//! ```text
//! -> {"action":"change-public-keys","publicKey":"<b64>","nonce":"<b64>","clientID":"<id>"}
//! <- {"action":"change-public-keys","publicKey":"<b64>","success":"true","version":"2.7.6","nonce":"<b64>"}
//!
//! -> {"action":"get-logins","message":"<b64 box>","nonce":"<b64>","clientID":"<id>"}
//! <- {"action":"get-logins","message":"<b64 box>","nonce":"<b64>"}
//!
//! <- {"action":"get-logins","error":"No logins found","errorCode":"15"}
//! <- {"action":"database-locked"}
//! ```
//!
//! Outbound and inbound messages decode into disjoint typed variants, so a
//! handshake message is never run through decryption and an encrypted one is
//! never accepted as plaintext.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kpx_crypto::nonce::{nonce_from_base64, nonce_to_base64};
use kpx_crypto::{Nonce, PublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Proxy actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ChangePublicKeys,
    GetDatabaseHash,
    Associate,
    TestAssociate,
    GetLogins,
    SetLogin,
    GetDatabaseGroups,
    GeneratePassword,
    LockDatabase,
    CreateNewGroup,
    GetTotp,
    DeleteEntry,
    RequestAutotype,
    PasskeysRegister,
    PasskeysGet,
    DatabaseLocked,
    DatabaseUnlocked,
}

impl Action {
    pub const ALL: [Action; 17] = [
        Action::ChangePublicKeys,
        Action::GetDatabaseHash,
        Action::Associate,
        Action::TestAssociate,
        Action::GetLogins,
        Action::SetLogin,
        Action::GetDatabaseGroups,
        Action::GeneratePassword,
        Action::LockDatabase,
        Action::CreateNewGroup,
        Action::GetTotp,
        Action::DeleteEntry,
        Action::RequestAutotype,
        Action::PasskeysRegister,
        Action::PasskeysGet,
        Action::DatabaseLocked,
        Action::DatabaseUnlocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ChangePublicKeys => "change-public-keys",
            Action::GetDatabaseHash => "get-databasehash",
            Action::Associate => "associate",
            Action::TestAssociate => "test-associate",
            Action::GetLogins => "get-logins",
            Action::SetLogin => "set-login",
            Action::GetDatabaseGroups => "get-database-groups",
            Action::GeneratePassword => "generate-password",
            Action::LockDatabase => "lock-database",
            Action::CreateNewGroup => "create-new-group",
            Action::GetTotp => "get-totp",
            Action::DeleteEntry => "delete-entry",
            Action::RequestAutotype => "request-autotype",
            Action::PasskeysRegister => "passkeys-register",
            Action::PasskeysGet => "passkeys-get",
            Action::DatabaseLocked => "database-locked",
            Action::DatabaseUnlocked => "database-unlocked",
        }
    }

    /// Unsolicited notifications pushed by the proxy.
    pub fn is_signal(&self) -> bool {
        matches!(self, Action::DatabaseLocked | Action::DatabaseUnlocked)
    }

    /// Actions that may open a dialog in the password manager and wait for the user.
    pub fn prompts_user(&self) -> bool {
        matches!(
            self,
            Action::Associate
                | Action::GetLogins
                | Action::SetLogin
                | Action::GeneratePassword
                | Action::CreateNewGroup
                | Action::DeleteEntry
                | Action::PasskeysRegister
                | Action::PasskeysGet
        )
    }

    /// Actions that need a validated association with the current database.
    pub fn requires_association(&self) -> bool {
        matches!(
            self,
            Action::GetLogins
                | Action::SetLogin
                | Action::GetDatabaseGroups
                | Action::CreateNewGroup
                | Action::GetTotp
                | Action::DeleteEntry
                | Action::RequestAutotype
                | Action::PasskeysRegister
                | Action::PasskeysGet
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::malformed(format!("unknown action `{}`", s)))
    }
}

/// Error codes sent by the proxy in `errorCode`.
///
/// Unknown codes are kept as `Other` rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    DatabaseNotOpened,
    DatabaseHashNotReceived,
    ClientPublicKeyNotReceived,
    CannotDecryptMessage,
    TimeoutOrNotConnected,
    ActionCancelledOrDenied,
    CannotEncryptMessage,
    AssociationFailed,
    KeyChangeFailed,
    EncryptionKeyUnrecognized,
    NoSavedDatabasesFound,
    IncorrectAction,
    EmptyMessageReceived,
    NoUrlProvided,
    NoLoginsFound,
    NoGroupsFound,
    CannotCreateNewGroup,
    NoValidUuidProvided,
    AccessToAllEntriesDenied,
    Other(i64),
}

impl ErrorCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::DatabaseNotOpened,
            2 => Self::DatabaseHashNotReceived,
            3 => Self::ClientPublicKeyNotReceived,
            4 => Self::CannotDecryptMessage,
            5 => Self::TimeoutOrNotConnected,
            6 => Self::ActionCancelledOrDenied,
            7 => Self::CannotEncryptMessage,
            8 => Self::AssociationFailed,
            9 => Self::KeyChangeFailed,
            10 => Self::EncryptionKeyUnrecognized,
            11 => Self::NoSavedDatabasesFound,
            12 => Self::IncorrectAction,
            13 => Self::EmptyMessageReceived,
            14 => Self::NoUrlProvided,
            15 => Self::NoLoginsFound,
            16 => Self::NoGroupsFound,
            17 => Self::CannotCreateNewGroup,
            18 => Self::NoValidUuidProvided,
            19 => Self::AccessToAllEntriesDenied,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::DatabaseNotOpened => 1,
            Self::DatabaseHashNotReceived => 2,
            Self::ClientPublicKeyNotReceived => 3,
            Self::CannotDecryptMessage => 4,
            Self::TimeoutOrNotConnected => 5,
            Self::ActionCancelledOrDenied => 6,
            Self::CannotEncryptMessage => 7,
            Self::AssociationFailed => 8,
            Self::KeyChangeFailed => 9,
            Self::EncryptionKeyUnrecognized => 10,
            Self::NoSavedDatabasesFound => 11,
            Self::IncorrectAction => 12,
            Self::EmptyMessageReceived => 13,
            Self::NoUrlProvided => 14,
            Self::NoLoginsFound => 15,
            Self::NoGroupsFound => 16,
            Self::CannotCreateNewGroup => 17,
            Self::NoValidUuidProvided => 18,
            Self::AccessToAllEntriesDenied => 19,
            Self::Other(code) => *code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Messages we send.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Plaintext key exchange; the only message that carries key material in the clear.
    KeyExchange {
        public_key: PublicKey,
        nonce: Nonce,
        client_id: String,
    },
    /// Boxed action request.
    Encrypted {
        action: Action,
        message: Vec<u8>,
        nonce: Nonce,
        client_id: String,
        trigger_unlock: bool,
    },
}

#[derive(Serialize)]
struct KeyExchangeWire<'a> {
    action: &'static str,
    #[serde(rename = "publicKey")]
    public_key: String,
    nonce: String,
    #[serde(rename = "clientID")]
    client_id: &'a str,
}

#[derive(Serialize)]
struct EncryptedWire<'a> {
    action: &'static str,
    message: String,
    nonce: String,
    #[serde(rename = "clientID")]
    client_id: &'a str,
    #[serde(rename = "triggerUnlock", skip_serializing_if = "Option::is_none")]
    trigger_unlock: Option<&'static str>,
}

impl Outbound {
    pub fn action(&self) -> Action {
        match self {
            Outbound::KeyExchange { .. } => Action::ChangePublicKeys,
            Outbound::Encrypted { action, .. } => *action,
        }
    }

    pub fn nonce(&self) -> &Nonce {
        match self {
            Outbound::KeyExchange { nonce, .. } | Outbound::Encrypted { nonce, .. } => nonce,
        }
    }

    /// Serialize to wire text.
    pub fn encode(&self) -> Result<String> {
        let text = match self {
            Outbound::KeyExchange {
                public_key,
                nonce,
                client_id,
            } => serde_json::to_string(&KeyExchangeWire {
                action: Action::ChangePublicKeys.as_str(),
                public_key: public_key.to_base64(),
                nonce: nonce_to_base64(nonce),
                client_id,
            })?,
            Outbound::Encrypted {
                action,
                message,
                nonce,
                client_id,
                trigger_unlock,
            } => {
                if *action == Action::ChangePublicKeys || action.is_signal() {
                    return Err(Error::protocol(format!(
                        "`{}` cannot be sent as an encrypted request",
                        action
                    )));
                }
                serde_json::to_string(&EncryptedWire {
                    action: action.as_str(),
                    message: STANDARD.encode(message),
                    nonce: nonce_to_base64(nonce),
                    client_id,
                    trigger_unlock: trigger_unlock.then_some("true"),
                })?
            }
        };
        Ok(text)
    }
}

/// Reply to `change-public-keys`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangeReply {
    pub success: bool,
    /// Raw decoded key bytes; length is checked by the handshake.
    pub public_key: Option<Vec<u8>>,
    pub version: Option<String>,
    pub nonce: Nonce,
}

/// Boxed reply to an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedReply {
    pub action: Action,
    pub nonce: Nonce,
    pub message: Vec<u8>,
}

/// Plaintext error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReply {
    pub action: Action,
    pub code: ErrorCode,
    pub message: String,
}

impl FailureReply {
    /// Map the proxy's error code onto the error taxonomy.
    pub fn into_error(self) -> Error {
        match self.code {
            ErrorCode::DatabaseNotOpened => Error::DatabaseLocked,
            ErrorCode::TimeoutOrNotConnected => Error::timeout(self.message),
            ErrorCode::CannotDecryptMessage | ErrorCode::EncryptionKeyUnrecognized => {
                Error::Authentication
            }
            ErrorCode::ActionCancelledOrDenied | ErrorCode::AssociationFailed
                if self.action == Action::Associate =>
            {
                Error::AssociationDenied(self.message)
            }
            ErrorCode::AssociationFailed => Error::NotAssociated(self.message),
            code => Error::Rejected {
                code,
                message: self.message,
            },
        }
    }
}

/// Unsolicited notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    DatabaseLocked,
    DatabaseUnlocked,
}

/// Messages we receive, classified by shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    KeyExchange(KeyExchangeReply),
    Encrypted(EncryptedReply),
    Failure(FailureReply),
    Signal(Signal),
}

impl Inbound {
    pub fn action(&self) -> Action {
        match self {
            Inbound::KeyExchange(_) => Action::ChangePublicKeys,
            Inbound::Encrypted(reply) => reply.action,
            Inbound::Failure(reply) => reply.action,
            Inbound::Signal(Signal::DatabaseLocked) => Action::DatabaseLocked,
            Inbound::Signal(Signal::DatabaseUnlocked) => Action::DatabaseUnlocked,
        }
    }
}

/// Every field any inbound message may carry.
#[derive(Debug, Deserialize)]
struct RawInbound {
    action: Option<String>,
    #[serde(rename = "publicKey")]
    public_key: Option<String>,
    nonce: Option<String>,
    message: Option<String>,
    success: Option<Value>,
    version: Option<String>,
    error: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<Value>,
}

/// Interpret the proxy's loosely typed booleans (`"true"`, `true`).
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Parse `errorCode`, sent as either a string or a number.
pub fn parse_error_code(value: &Value) -> Result<ErrorCode> {
    let code = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    code.map(ErrorCode::from_code)
        .ok_or_else(|| Error::malformed(format!("invalid errorCode: {}", value)))
}

fn decode_nonce(field: Option<&str>) -> Result<Nonce> {
    let text = field.ok_or_else(|| Error::malformed("missing nonce"))?;
    nonce_from_base64(text).map_err(|e| Error::malformed(e.to_string()))
}

/// Decode and classify one inbound message.
///
/// The message is accepted or rejected as a whole; on error nothing of it is used.
pub fn decode(text: &str) -> Result<Inbound> {
    let raw: RawInbound = serde_json::from_str(text)?;

    let action_text = raw
        .action
        .as_deref()
        .ok_or_else(|| Error::malformed("missing action"))?;
    let action = Action::from_str(action_text)?;

    // Signals are identified by their tag alone; other fields are ignored.
    match action {
        Action::DatabaseLocked => return Ok(Inbound::Signal(Signal::DatabaseLocked)),
        Action::DatabaseUnlocked => return Ok(Inbound::Signal(Signal::DatabaseUnlocked)),
        _ => {}
    }

    if raw.error.is_some() || raw.error_code.is_some() {
        let code = match &raw.error_code {
            Some(value) => parse_error_code(value)?,
            None => ErrorCode::Other(0),
        };
        return Ok(Inbound::Failure(FailureReply {
            action,
            code,
            message: raw.error.unwrap_or_default(),
        }));
    }

    match action {
        Action::ChangePublicKeys => {
            if raw.message.is_some() {
                return Err(Error::malformed(
                    "key exchange reply must not carry an encrypted message",
                ));
            }
            let public_key = raw
                .public_key
                .as_deref()
                .map(|k| STANDARD.decode(k))
                .transpose()
                .map_err(|e| Error::malformed(format!("invalid publicKey: {}", e)))?;
            Ok(Inbound::KeyExchange(KeyExchangeReply {
                success: raw.success.as_ref().map(is_truthy).unwrap_or(false),
                public_key,
                version: raw.version,
                nonce: decode_nonce(raw.nonce.as_deref())?,
            }))
        }
        _ => {
            if raw.public_key.is_some() {
                return Err(Error::malformed(format!(
                    "unexpected publicKey in `{}` reply",
                    action
                )));
            }
            let message = raw
                .message
                .as_deref()
                .ok_or_else(|| Error::malformed(format!("`{}` reply without message", action)))?;
            let message = STANDARD
                .decode(message)
                .map_err(|e| Error::malformed(format!("invalid message encoding: {}", e)))?;
            Ok(Inbound::Encrypted(EncryptedReply {
                action,
                nonce: decode_nonce(raw.nonce.as_deref())?,
                message,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpx_crypto::KeyPair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn b64_nonce(byte: u8) -> String {
        STANDARD.encode([byte; 24])
    }

    #[test]
    fn test_action_names_roundtrip() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("get-everything".parse::<Action>().is_err());
    }

    #[test]
    fn test_encode_key_exchange() {
        let mut rng = StdRng::seed_from_u64(5);
        let keys = KeyPair::generate(&mut rng);
        let msg = Outbound::KeyExchange {
            public_key: *keys.public(),
            nonce: [1u8; 24],
            client_id: "client-1".into(),
        };

        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["action"], "change-public-keys");
        assert_eq!(value["publicKey"], keys.public().to_base64());
        assert_eq!(value["nonce"], b64_nonce(1));
        assert_eq!(value["clientID"], "client-1");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_encode_encrypted_with_unlock() {
        let msg = Outbound::Encrypted {
            action: Action::GetDatabaseHash,
            message: vec![9, 9, 9],
            nonce: [2u8; 24],
            client_id: "client-1".into(),
            trigger_unlock: true,
        };

        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["action"], "get-databasehash");
        assert_eq!(value["message"], STANDARD.encode([9, 9, 9]));
        assert_eq!(value["triggerUnlock"], "true");
        assert!(value.get("publicKey").is_none());
    }

    #[test]
    fn test_encode_rejects_plaintext_action_as_encrypted() {
        let msg = Outbound::Encrypted {
            action: Action::ChangePublicKeys,
            message: vec![],
            nonce: [0u8; 24],
            client_id: "c".into(),
            trigger_unlock: false,
        };
        assert!(matches!(msg.encode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decode_key_exchange_reply() {
        let text = json!({
            "action": "change-public-keys",
            "publicKey": STANDARD.encode([4u8; 32]),
            "success": "true",
            "version": "2.7.6",
            "nonce": b64_nonce(3),
        })
        .to_string();

        match decode(&text).unwrap() {
            Inbound::KeyExchange(reply) => {
                assert!(reply.success);
                assert_eq!(reply.public_key, Some(vec![4u8; 32]));
                assert_eq!(reply.version.as_deref(), Some("2.7.6"));
                assert_eq!(reply.nonce, [3u8; 24]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_encrypted_reply() {
        let text = json!({
            "action": "get-logins",
            "message": STANDARD.encode([7u8; 40]),
            "nonce": b64_nonce(5),
        })
        .to_string();

        assert_eq!(
            decode(&text).unwrap(),
            Inbound::Encrypted(EncryptedReply {
                action: Action::GetLogins,
                nonce: [5u8; 24],
                message: vec![7u8; 40],
            })
        );
    }

    #[test]
    fn test_decode_failure_reply() {
        let text = r#"{"action":"get-logins","error":"No logins found","errorCode":"15"}"#;
        match decode(text).unwrap() {
            Inbound::Failure(reply) => {
                assert_eq!(reply.code, ErrorCode::NoLoginsFound);
                assert_eq!(reply.message, "No logins found");
            }
            other => panic!("unexpected {:?}", other),
        }

        let numeric = r#"{"action":"associate","error":"denied","errorCode":6}"#;
        let Inbound::Failure(reply) = decode(numeric).unwrap() else {
            panic!("expected failure");
        };
        assert!(matches!(reply.into_error(), Error::AssociationDenied(_)));
    }

    #[test]
    fn test_decode_signals() {
        assert_eq!(
            decode(r#"{"action":"database-locked"}"#).unwrap(),
            Inbound::Signal(Signal::DatabaseLocked)
        );
        assert_eq!(
            decode(r#"{"action":"database-unlocked"}"#).unwrap(),
            Inbound::Signal(Signal::DatabaseUnlocked)
        );
    }

    #[test]
    fn test_decode_signal_with_extra_fields() {
        let text = format!(
            r#"{{"action":"database-locked","message":"AAAA","nonce":"{}"}}"#,
            b64_nonce(3)
        );
        assert_eq!(
            decode(&text).unwrap(),
            Inbound::Signal(Signal::DatabaseLocked)
        );
        assert_eq!(
            decode(r#"{"action":"database-unlocked","error":"","success":"true"}"#).unwrap(),
            Inbound::Signal(Signal::DatabaseUnlocked)
        );
    }

    #[test]
    fn test_decode_rejects_structural_violations() {
        // Not JSON
        assert!(matches!(decode("{\"action\""), Err(Error::MalformedMessage(_))));
        // No action
        assert!(matches!(
            decode(r#"{"message":"AAAA","nonce":"AAAA"}"#),
            Err(Error::MalformedMessage(_))
        ));
        // Short nonce
        let short = json!({
            "action": "get-logins",
            "message": STANDARD.encode([1u8; 20]),
            "nonce": STANDARD.encode([0u8; 16]),
        })
        .to_string();
        assert!(matches!(decode(&short), Err(Error::MalformedMessage(_))));
        // Encrypted reply without message
        let missing = json!({"action": "get-totp", "nonce": b64_nonce(1)}).to_string();
        assert!(matches!(decode(&missing), Err(Error::MalformedMessage(_))));
        // Handshake reply carrying ciphertext
        let mixed = json!({
            "action": "change-public-keys",
            "message": STANDARD.encode([1u8; 20]),
            "nonce": b64_nonce(1),
        })
        .to_string();
        assert!(matches!(decode(&mixed), Err(Error::MalformedMessage(_))));
        // Bad base64
        let bad = json!({"action": "get-totp", "message": "%%%", "nonce": b64_nonce(1)}).to_string();
        assert!(matches!(decode(&bad), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_failure_mapping() {
        let locked = FailureReply {
            action: Action::GetLogins,
            code: ErrorCode::DatabaseNotOpened,
            message: "Database not opened".into(),
        };
        assert!(matches!(locked.into_error(), Error::DatabaseLocked));

        let unknown = FailureReply {
            action: Action::GetTotp,
            code: ErrorCode::from_code(42),
            message: "future error".into(),
        };
        match unknown.into_error() {
            Error::Rejected { code, .. } => assert_eq!(code, ErrorCode::Other(42)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truthy_values() {
        assert!(is_truthy(&json!("true")));
        assert!(is_truthy(&json!(true)));
        assert!(!is_truthy(&json!("false")));
        assert!(!is_truthy(&json!(1)));
    }
}
