pub mod canonical;
pub mod client;
pub mod clock;
pub mod config;
pub mod endpoints;
pub mod errors;
pub mod gate;
pub mod identity;
pub mod nonce;
pub mod ratelimit;
pub mod signature;
pub mod types;
pub mod web_api;

pub use canonical::build_message;
pub use client::{generate_nonce, sign_envelope, ClientError, LocalKeySigner, MessageSigner};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GateConfig, IssuerConfig};
pub use endpoints::{EndpointDescriptor, EndpointRegistry};
pub use errors::{ErrorKind, GateError};
pub use gate::{AuthorizationGate, GateDecision};
pub use identity::{IdentityVerifier, JwksSource, KeySetError, StaticJwks};
pub use nonce::{NonceLedger, NonceStore, RecordOutcome};
pub use types::*;

#[cfg(feature = "remote-http")]
pub use client::StepUpClient;
#[cfg(feature = "remote-http")]
pub use identity::HttpJwksSource;
