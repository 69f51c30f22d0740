//! GSS-API style security contexts and HTTP Negotiate authentication.
//!
//! The mechanism itself lives behind [`SecurityProvider`]: the system GSS-API library
//! (feature `gssapi`, unix only) or the in-process [`loopback`] provider. Everything else
//! here owns provider resources and releases each of them exactly once.

pub mod buffer;
pub mod channel_bindings;
pub mod config;
pub mod context;
pub mod credentials;
mod error;
pub mod handshake;
pub mod loopback;
pub mod name;
pub mod negotiate;
pub mod oid;
pub mod pin;
pub mod provider;
pub mod settings;
mod sign_encrypt;
pub mod step;
#[cfg(all(unix, feature = "gssapi"))]
pub mod unix;

pub use buffer::{Origin, ProviderAllocation, TokenBuffer};
pub use context::{ContextState, InitiateRequest, SecurityContext};
pub use credentials::{Credential, CredentialUsage};
pub use error::{Error, MajorStatus, ProviderError};
pub use name::Principal;
pub use negotiate::{NegotiateError, NegotiateSession, Outcome, Verification};
pub use oid::{Oid, OidSet};
pub use provider::{Provider, SecurityProvider};
pub use settings::{ContextFlags, Lifetime, Qop};
pub use sign_encrypt::{Unwrapped, Wrapped};
pub use step::StepOut;
