//! Wire messages exchanged between host and companion device.
//!
//! Every message is a flat JSON object. Requests carry their command in
//! `request_command`, replies in `response_command`. Field names are a
//! compatibility contract with the device firmware and must not change.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::auth::AuthAttempt;
use crate::crypto::{Authenticators, KeyMaterial};
use crate::error::{DecodeError, ProtocolError, Result};

/// Discriminator field of host-to-device messages.
pub const REQUEST_FIELD: &str = "request_command";

/// Discriminator field of device-to-host messages.
pub const RESPONSE_FIELD: &str = "response_command";

/// Protocol command tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Host asks the device for fresh shared keys
    RequestKeys,
    /// Device returns device key, auth key, name and model
    RequestKeysReply,
    /// Host asks the device for a nonce to start an attempt
    RequestNonce,
    /// Device returns its nonce
    RequestNonceReply,
    /// Host sends its service HMAC and the session/device nonces
    RequestMac,
    /// Device returns its two authenticators
    RequestMacReply,
}

impl Command {
    /// Wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestKeys => "REQUEST_KEYS",
            Self::RequestKeysReply => "REQUEST_KEYS_REPLY",
            Self::RequestNonce => "REQUEST_NONCE",
            Self::RequestNonceReply => "REQUEST_NONCE_REPLY",
            Self::RequestMac => "REQUEST_MAC",
            Self::RequestMacReply => "REQUEST_MAC_REPLY",
        }
    }

    /// Whether this command travels device-to-host.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::RequestKeysReply | Self::RequestNonceReply | Self::RequestMacReply
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "REQUEST_KEYS" => Ok(Self::RequestKeys),
            "REQUEST_KEYS_REPLY" => Ok(Self::RequestKeysReply),
            "REQUEST_NONCE" => Ok(Self::RequestNonce),
            "REQUEST_NONCE_REPLY" => Ok(Self::RequestNonceReply),
            "REQUEST_MAC" => Ok(Self::RequestMac),
            "REQUEST_MAC_REPLY" => Ok(Self::RequestMacReply),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// `REQUEST_KEYS`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDeviceRequest {
    /// Always [`Command::RequestKeys`]
    pub request_command: Command,
}

impl Default for RegisterDeviceRequest {
    fn default() -> Self {
        Self {
            request_command: Command::RequestKeys,
        }
    }
}

/// `REQUEST_KEYS_REPLY`. Carries key material; zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RegisterDeviceResponse {
    /// Always [`Command::RequestKeysReply`]
    #[zeroize(skip)]
    pub response_command: Command,
    /// Base64 device key
    pub device_key: String,
    /// Base64 auth key
    pub auth_key: String,
    /// Friendly name of the device
    pub device_name: String,
    /// Model of the device
    pub device_model: String,
}

impl RegisterDeviceResponse {
    /// Build a reply from raw keys.
    pub fn new(
        device_key: &KeyMaterial,
        auth_key: &KeyMaterial,
        device_name: impl Into<String>,
        device_model: impl Into<String>,
    ) -> Self {
        Self {
            response_command: Command::RequestKeysReply,
            device_key: device_key.to_base64(),
            auth_key: auth_key.to_base64(),
            device_name: device_name.into(),
            device_model: device_model.into(),
        }
    }

    /// Decode `(device_key, auth_key)`.
    pub fn keys(&self) -> std::result::Result<(KeyMaterial, KeyMaterial), DecodeError> {
        let device_key = KeyMaterial::from_base64(&self.device_key)?;
        let auth_key = KeyMaterial::from_base64(&self.auth_key)?;
        Ok((device_key, auth_key))
    }
}

impl fmt::Debug for RegisterDeviceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterDeviceResponse")
            .field("response_command", &self.response_command)
            .field("device_name", &self.device_name)
            .field("device_model", &self.device_model)
            .finish_non_exhaustive()
    }
}

/// `REQUEST_NONCE`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceRequest {
    /// Always [`Command::RequestNonce`]
    pub request_command: Command,
}

impl Default for NonceRequest {
    fn default() -> Self {
        Self {
            request_command: Command::RequestNonce,
        }
    }
}

/// `REQUEST_NONCE_REPLY`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceResponse {
    /// Always [`Command::RequestNonceReply`]
    pub response_command: Command,
    /// Base64 nonce
    pub nonce: String,
}

impl NonceResponse {
    /// Build a reply from raw nonce bytes.
    pub fn new(nonce: &[u8]) -> Self {
        Self {
            response_command: Command::RequestNonceReply,
            nonce: STANDARD.encode(nonce),
        }
    }

    /// Decoded nonce bytes
    pub fn nonce_bytes(&self) -> std::result::Result<Vec<u8>, DecodeError> {
        Ok(STANDARD.decode(&self.nonce)?)
    }
}

/// `REQUEST_MAC`: the host's half of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HMacRequest {
    /// Always [`Command::RequestMac`]
    pub request_command: Command,
    /// Base64 service authentication HMAC
    pub srv_nonce: String,
    /// Base64 session nonce
    pub sess_nonce: String,
    /// Base64 device nonce
    pub dev_nonce: String,
}

impl HMacRequest {
    /// Build from raw challenge values.
    pub fn new(service_hmac: &[u8], session_nonce: &[u8], device_nonce: &[u8]) -> Self {
        Self {
            request_command: Command::RequestMac,
            srv_nonce: STANDARD.encode(service_hmac),
            sess_nonce: STANDARD.encode(session_nonce),
            dev_nonce: STANDARD.encode(device_nonce),
        }
    }

    /// Build from an attempt the subsystem just started.
    pub fn from_attempt(attempt: &AuthAttempt) -> Self {
        Self::new(
            &attempt.service_hmac,
            &attempt.session_nonce,
            &attempt.device_nonce,
        )
    }

    /// Decode `(service_hmac, session_nonce, device_nonce)`.
    pub fn decode_fields(&self) -> std::result::Result<(Vec<u8>, Vec<u8>, Vec<u8>), DecodeError> {
        Ok((
            STANDARD.decode(&self.srv_nonce)?,
            STANDARD.decode(&self.sess_nonce)?,
            STANDARD.decode(&self.dev_nonce)?,
        ))
    }
}

/// `REQUEST_MAC_REPLY`: the device's two authenticators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HMacResponse {
    /// Always [`Command::RequestMacReply`]
    pub response_command: Command,
    /// Base64 `HMAC(device_key, device_nonce)`
    pub hmac_dk: String,
    /// Base64 `HMAC(auth_key, hmac_dk || session_nonce)`
    pub hmac_sk: String,
}

impl HMacResponse {
    /// Build from computed authenticators.
    pub fn new(authenticators: &Authenticators) -> Self {
        Self {
            response_command: Command::RequestMacReply,
            hmac_dk: STANDARD.encode(authenticators.hmac_dk),
            hmac_sk: STANDARD.encode(authenticators.hmac_sk),
        }
    }

    /// Decode `(hmac_dk, hmac_sk)`.
    pub fn decode_tags(&self) -> std::result::Result<(Vec<u8>, Vec<u8>), DecodeError> {
        Ok((STANDARD.decode(&self.hmac_dk)?, STANDARD.decode(&self.hmac_sk)?))
    }
}

/// Any device-to-host message, decoded by its discriminator.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `REQUEST_KEYS_REPLY`
    Keys(RegisterDeviceResponse),
    /// `REQUEST_NONCE_REPLY`
    Nonce(NonceResponse),
    /// `REQUEST_MAC_REPLY`
    Mac(HMacResponse),
}

impl Reply {
    /// Peek `response_command`, then decode the matching variant.
    pub fn decode(json: &str) -> Result<Self> {
        let command = peek(json, RESPONSE_FIELD)?;
        match command {
            Command::RequestKeysReply => Ok(Self::Keys(decode_as(json)?)),
            Command::RequestNonceReply => Ok(Self::Nonce(decode_as(json)?)),
            Command::RequestMacReply => Ok(Self::Mac(decode_as(json)?)),
            other => Err(ProtocolError::UnexpectedCommand(other).into()),
        }
    }

    /// Command tag of this reply
    pub fn command(&self) -> Command {
        match self {
            Self::Keys(_) => Command::RequestKeysReply,
            Self::Nonce(_) => Command::RequestNonceReply,
            Self::Mac(_) => Command::RequestMacReply,
        }
    }
}

/// Any host-to-device message, decoded by its discriminator.
#[derive(Debug, Clone)]
pub enum Request {
    /// `REQUEST_KEYS`
    Keys(RegisterDeviceRequest),
    /// `REQUEST_NONCE`
    Nonce(NonceRequest),
    /// `REQUEST_MAC`
    Mac(HMacRequest),
}

impl Request {
    /// Peek `request_command`, then decode the matching variant.
    pub fn decode(json: &str) -> Result<Self> {
        let command = peek(json, REQUEST_FIELD)?;
        match command {
            Command::RequestKeys => Ok(Self::Keys(decode_as(json)?)),
            Command::RequestNonce => Ok(Self::Nonce(decode_as(json)?)),
            Command::RequestMac => Ok(Self::Mac(decode_as(json)?)),
            other => Err(ProtocolError::UnexpectedCommand(other).into()),
        }
    }

    /// Command tag of this request
    pub fn command(&self) -> Command {
        match self {
            Self::Keys(_) => Command::RequestKeys,
            Self::Nonce(_) => Command::RequestNonce,
            Self::Mac(_) => Command::RequestMac,
        }
    }
}

/// Both discriminators; every other field is skipped without being copied.
#[derive(Deserialize)]
struct Discriminators {
    #[serde(default)]
    request_command: Option<String>,
    #[serde(default)]
    response_command: Option<String>,
}

fn peek(json: &str, field: &'static str) -> Result<Command> {
    let tags: Discriminators = serde_json::from_str(json).map_err(DecodeError::from)?;
    let tag = match field {
        REQUEST_FIELD => tags.request_command,
        _ => tags.response_command,
    };
    let tag = tag.ok_or(DecodeError::MissingDiscriminator(field))?;
    Ok(tag.parse::<Command>()?)
}

/// Decode straight from the text so key fields land only in the zeroizing struct.
fn decode_as<T: DeserializeOwned>(json: &str) -> std::result::Result<T, DecodeError> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::error::ProximityError;

    #[test]
    fn test_command_wire_names() {
        let json = serde_json::to_string(&NonceRequest::default()).unwrap();
        assert_eq!(json, r#"{"request_command":"REQUEST_NONCE"}"#);

        let json = serde_json::to_string(&RegisterDeviceRequest::default()).unwrap();
        assert_eq!(json, r#"{"request_command":"REQUEST_KEYS"}"#);

        for command in [
            Command::RequestKeys,
            Command::RequestKeysReply,
            Command::RequestNonce,
            Command::RequestNonceReply,
            Command::RequestMac,
            Command::RequestMacReply,
        ] {
            assert_eq!(command.as_str().parse::<Command>().unwrap(), command);
            assert_eq!(
                serde_json::to_value(command).unwrap(),
                Value::String(command.as_str().to_string())
            );
        }
    }

    #[test]
    fn test_hmac_request_field_names() {
        let request = HMacRequest::new(&[1, 2], &[3], &[4]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["request_command"], "REQUEST_MAC");
        assert_eq!(value["srv_nonce"], "AQI=");
        assert_eq!(value["sess_nonce"], "Aw==");
        assert_eq!(value["dev_nonce"], "BA==");
    }

    #[test]
    fn test_reply_decode_keys() {
        let json = r#"{"response_command":"REQUEST_KEYS_REPLY","device_key":"AAAAAAAAAAAAAAAAAAAAAA==","auth_key":"AQEBAQEBAQEBAQEBAQEBAQ==","device_name":"D1","device_model":"M1"}"#;
        let reply = Reply::decode(json).unwrap();
        assert_eq!(reply.command(), Command::RequestKeysReply);

        let Reply::Keys(keys) = reply else {
            panic!("expected keys reply");
        };
        assert_eq!(keys.device_name, "D1");
        let (device_key, auth_key) = keys.keys().unwrap();
        assert_eq!(device_key.as_bytes(), &[0u8; 16]);
        assert_eq!(auth_key.as_bytes(), &[1u8; 16]);
    }

    #[test]
    fn test_reply_decode_mac() {
        let json = r#"{"response_command":"REQUEST_MAC_REPLY","hmac_dk":"AQI=","hmac_sk":"Aw=="}"#;
        let Reply::Mac(mac) = Reply::decode(json).unwrap() else {
            panic!("expected mac reply");
        };
        assert_eq!(mac.decode_tags().unwrap(), (vec![1, 2], vec![3]));
    }

    #[test]
    fn test_reply_rejects_unknown_command() {
        let err = Reply::decode(r#"{"response_command":"REQUEST_COFFEE"}"#).unwrap_err();
        assert!(matches!(
            err,
            ProximityError::Protocol(ProtocolError::UnknownCommand(ref c)) if c == "REQUEST_COFFEE"
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_reply_rejects_request_command() {
        let err = Reply::decode(r#"{"response_command":"REQUEST_NONCE"}"#).unwrap_err();
        assert!(matches!(
            err,
            ProximityError::Protocol(ProtocolError::UnexpectedCommand(Command::RequestNonce))
        ));
    }

    #[test]
    fn test_reply_missing_discriminator() {
        let err = Reply::decode(r#"{"request_command":"REQUEST_NONCE_REPLY"}"#).unwrap_err();
        assert!(matches!(
            err,
            ProximityError::Decode(DecodeError::MissingDiscriminator(RESPONSE_FIELD))
        ));
    }

    #[test]
    fn test_reply_non_string_discriminator() {
        let err = Reply::decode(r#"{"response_command":7}"#).unwrap_err();
        assert!(matches!(err, ProximityError::Decode(DecodeError::Json(_))));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_keys_reply_decoded_from_text() {
        let reply = RegisterDeviceResponse::new(
            &KeyMaterial::new(vec![3; 16]),
            &KeyMaterial::new(vec![4; 16]),
            "Phone",
            "Model",
        );
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(peek(&json, RESPONSE_FIELD).unwrap(), Command::RequestKeysReply);
        assert!(matches!(
            peek(&json, REQUEST_FIELD),
            Err(ProximityError::Decode(DecodeError::MissingDiscriminator(REQUEST_FIELD)))
        ));

        let decoded: RegisterDeviceResponse = decode_as(&json).unwrap();
        assert_eq!(decoded.device_key, reply.device_key);
        assert_eq!(decoded.auth_key, reply.auth_key);
    }

    #[test]
    fn test_reply_missing_payload_field() {
        let err = Reply::decode(r#"{"response_command":"REQUEST_NONCE_REPLY"}"#).unwrap_err();
        assert!(matches!(err, ProximityError::Decode(DecodeError::Json(_))));
    }

    #[test]
    fn test_request_decode() {
        let request = Request::decode(r#"{"request_command":"REQUEST_KEYS"}"#).unwrap();
        assert_eq!(request.command(), Command::RequestKeys);

        let json = serde_json::to_string(&HMacRequest::new(b"s", b"t", b"d")).unwrap();
        let Request::Mac(mac) = Request::decode(&json).unwrap() else {
            panic!("expected mac request");
        };
        assert_eq!(
            mac.decode_fields().unwrap(),
            (b"s".to_vec(), b"t".to_vec(), b"d".to_vec())
        );
    }

    #[test]
    fn test_keys_reply_debug_hides_keys() {
        let reply = RegisterDeviceResponse::new(
            &KeyMaterial::new(vec![9; 16]),
            &KeyMaterial::new(vec![8; 16]),
            "Phone",
            "Model",
        );
        let debug = format!("{reply:?}");
        assert!(debug.contains("Phone"));
        assert!(!debug.contains(&reply.device_key));
    }
}
