//! Companion-device handshake protocol.
//!
//! The host drives the protocol; the companion device only answers.
//!
//! ## Message Flow
//!
//! ```text
//! Host                                      Companion
//!    |                                          |
//!    |---------- REQUEST_KEYS ---------------->|  Registration (once)
//!    |<-------- REQUEST_KEYS_REPLY ------------|  device_key, auth_key,
//!    |                                          |  device_name, device_model
//!    |                                          |
//!    |---------- REQUEST_NONCE --------------->|  Authentication
//!    |<-------- REQUEST_NONCE_REPLY -----------|  nonce
//!    |                                          |
//!    |---------- REQUEST_MAC ----------------->|  srv_nonce, sess_nonce,
//!    |                                          |  dev_nonce
//!    |<-------- REQUEST_MAC_REPLY -------------|  hmac_dk, hmac_sk
//! ```
//!
//! ## State Machine
//!
//! | Track          | State                   | Next                              |
//! |----------------|-------------------------|-----------------------------------|
//! | registration   | `Idle`                  | → AwaitingKeysReply               |
//! | registration   | `AwaitingKeysReply`     | → Idle                            |
//! | authentication | `Idle`                  | → AwaitingNonceReply              |
//! | authentication | `AwaitingNonceReply`    | → AuthenticationStarted, Failed   |
//! | authentication | `AuthenticationStarted` | → AwaitingMacReply, Failed        |
//! | authentication | `AwaitingMacReply`      | → Completed, Failed               |
//!
//! The two tracks never overlap in one session.
//!
//! ## Dispatch Policy
//!
//! | Inbound                          | Result                                 |
//! |----------------------------------|----------------------------------------|
//! | bad base64 / UTF-8 / JSON        | `DecodeError`, frame dropped           |
//! | unknown or request command       | `ProtocolError`, frame dropped         |
//! | reply with no request in flight  | `ProtocolError`, frame dropped         |
//! | subsystem refuses                | registration/authentication error, end |

mod dispatcher;
mod message;
mod session;

pub use dispatcher::Dispatcher;
pub use message::{
    Command, HMacRequest, HMacResponse, NonceRequest, NonceResponse, RegisterDeviceRequest,
    RegisterDeviceResponse, Reply, Request, REQUEST_FIELD, RESPONSE_FIELD,
};
pub use session::{
    AuthState, InFlightAttempt, RegistrationState, Session, SessionOutcome, SessionSelection,
};
