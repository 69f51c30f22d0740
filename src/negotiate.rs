//! SPNEGO over HTTP (RFC 4559).
//!
//! A [`NegotiateSession`] owns one credential and runs single-round handshakes against it:
//! the client side produces an `Authorization: Negotiate <token>` header, the server side
//! consumes it and answers with a status code and a `WWW-Authenticate` header.

use std::time::Duration;

use http::{
    header::{AUTHORIZATION, WWW_AUTHENTICATE},
    HeaderMap, StatusCode,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    buffer::TokenBuffer,
    context::{Accepted, InitiateRequest, SecurityContext},
    credentials::{Credential, CredentialUsage},
    error::{MajorStatus, ProviderError},
    handshake::{Handshake, DEFAULT_MAX_ROUNDS},
    name::Principal,
    oid::{Oid, GSS_KRB5_NT_PRINCIPAL_NAME},
    provider::Provider,
    settings::{ContextFlags, Lifetime},
    step::StepOut,
    Error,
};

mod error;
pub mod header;

pub use error::NegotiateError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}
impl SessionRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

#[derive(Clone, Debug)]
pub struct NegotiateSettings {
    name_type: Oid,
    credential_lifetime: Option<Lifetime>,
    flags: ContextFlags,
    mechanism: Option<Oid>,
    max_rounds: usize,
}
impl Default for NegotiateSettings {
    fn default() -> Self {
        Self {
            name_type: GSS_KRB5_NT_PRINCIPAL_NAME,
            credential_lifetime: None,
            flags: ContextFlags::empty(),
            mechanism: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}
impl NegotiateSettings {
    /// The name type the session's own principal is imported as.
    #[must_use]
    pub fn with_name_type(self, name_type: Oid) -> Self {
        Self { name_type, ..self }
    }
    #[must_use]
    pub fn with_credential_lifetime(self, duration: Duration) -> Self {
        Self {
            credential_lifetime: Some(Lifetime::Bounded(duration)),
            ..self
        }
    }
    /// Flags the client requests. Mutual authentication needs a second round trip, which
    /// the single-round profile reports as [`NegotiateError::UnexpectedContinuation`].
    #[must_use]
    pub fn with_flags(self, flags: ContextFlags) -> Self {
        Self { flags, ..self }
    }
    #[must_use]
    pub fn with_mechanism(self, mechanism: Oid) -> Self {
        Self {
            mechanism: Some(mechanism),
            ..self
        }
    }
    #[must_use]
    pub fn with_max_rounds(self, max_rounds: usize) -> Self {
        Self { max_rounds, ..self }
    }
}

/// What a server concluded about one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The request did not try Negotiate. The response carries a challenge.
    Unauthenticated,
    /// The display name of the authenticated client.
    Verified(String),
    /// The request tried Negotiate and failed.
    Rejected(String),
}
impl Outcome {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Verified(_) => StatusCode::OK,
            Self::Rejected(_) => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug)]
pub struct Verification {
    pub outcome: Outcome,
    pub status: StatusCode,
    pub error: Option<NegotiateError>,
}
impl Verification {
    fn new(outcome: Outcome, error: Option<NegotiateError>) -> Self {
        Self {
            status: outcome.status(),
            outcome,
            error,
        }
    }
    fn rejected(error: NegotiateError) -> Self {
        Self::new(Outcome::Rejected(error.to_string()), Some(error))
    }
    pub fn identity(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Verified(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Imports `name` and checks that the provider displays it back unchanged.
pub fn prepare_service_name(provider: &Provider, name: &str, name_type: &Oid) -> Result<Principal, Error> {
    let principal = Principal::parse(provider, name, name_type)?;
    let displayed = principal.display()?.text;
    if displayed != name {
        return Err(Error::Import(ProviderError::new(
            MajorStatus::BAD_NAME,
            0,
            format!("name displays as {displayed:?}, expected {name:?}"),
        )));
    }
    Ok(principal)
}

#[derive(Debug)]
pub struct NegotiateSession {
    role: SessionRole,
    provider: Provider,
    identity: Principal,
    credential: Mutex<Credential>,
    settings: NegotiateSettings,
}
impl NegotiateSession {
    pub fn client(provider: &Provider, name: &str) -> Result<Self, Error> {
        Self::with_settings(provider, SessionRole::Client, name, NegotiateSettings::default())
    }
    pub fn server(provider: &Provider, name: &str) -> Result<Self, Error> {
        Self::with_settings(provider, SessionRole::Server, name, NegotiateSettings::default())
    }
    pub fn with_settings(
        provider: &Provider,
        role: SessionRole,
        name: &str,
        settings: NegotiateSettings,
    ) -> Result<Self, Error> {
        let identity = prepare_service_name(provider, name, &settings.name_type)?;
        let usage = match role {
            SessionRole::Client => CredentialUsage::Initiate,
            SessionRole::Server => CredentialUsage::Accept,
        };
        let mechanisms = settings.mechanism.clone().map(|m| [m].into_iter().collect());
        let acquired = Credential::acquire(
            provider,
            Some(&identity),
            settings.credential_lifetime,
            mechanisms.as_ref(),
            usage,
        )?;
        debug!(role = role.as_str(), identity = name, mechs = %acquired.mechanisms, "negotiate session ready");
        Ok(Self {
            role,
            provider: provider.clone(),
            identity,
            credential: Mutex::new(acquired.credential),
            settings,
        })
    }
    pub fn role(&self) -> SessionRole {
        self.role
    }
    pub fn identity(&self) -> &Principal {
        &self.identity
    }
    pub fn settings(&self) -> &NegotiateSettings {
        &self.settings
    }

    fn require(&self, role: SessionRole, operation: &'static str) -> Result<(), NegotiateError> {
        if self.role != role {
            return Err(NegotiateError::Role(self.role.as_str(), operation));
        }
        Ok(())
    }

    /// Sets `Authorization: Negotiate <token>` for a request to `target`.
    pub fn authorize(&self, target: &Principal, headers: &mut HeaderMap) -> Result<(), NegotiateError> {
        self.require(SessionRole::Client, "authorize")?;
        let credential = self.credential.lock();
        let mut request = InitiateRequest::new(target)
            .with_credential(&credential)
            .with_flags(self.settings.flags);
        if let Some(mechanism) = &self.settings.mechanism {
            request = request.with_mechanism(mechanism.clone());
        }
        let mut handshake = Handshake::new(SecurityContext::initiator(&self.provider), self.settings.max_rounds);
        let token = match handshake.initiate(&request, None) {
            StepOut::Finished(initiated) => initiated.output_token,
            StepOut::Continue(_) => return Err(NegotiateError::UnexpectedContinuation),
            StepOut::Failed(err) => return Err(err.into()),
        };
        if let Err(err) = handshake.into_context().delete() {
            warn!(%err, "failed to delete client security context");
        }
        if token.is_empty() {
            return Err(NegotiateError::EmptyToken);
        }
        headers.insert(AUTHORIZATION, header::encode(token.as_bytes())?);
        debug!(target = %target, "authorization header set");
        Ok(())
    }

    /// Authenticates the request carried by `request` and fills `response` with the
    /// `WWW-Authenticate` header to send back.
    pub fn verify(&self, request: &HeaderMap, response: &mut HeaderMap) -> Verification {
        if let Err(err) = self.require(SessionRole::Server, "verify") {
            return Verification::rejected(err);
        }
        let token = match header::decode(request, AUTHORIZATION) {
            Ok(token) => token,
            Err(err) if err.is_unauthenticated() => {
                debug!(%err, "challenging request");
                response.insert(WWW_AUTHENTICATE, http::HeaderValue::from_static(header::SCHEME));
                return Verification::new(Outcome::Unauthenticated, Some(err));
            }
            Err(err) => {
                debug!(%err, "rejecting malformed Negotiate header");
                return Verification::rejected(err);
            }
        };
        match self.accept(TokenBuffer::from(token)) {
            Ok((identity, reply)) => match header::encode(reply.as_bytes()) {
                Ok(value) => {
                    response.insert(WWW_AUTHENTICATE, value);
                    debug!(%identity, "request verified");
                    Verification::new(Outcome::Verified(identity), None)
                }
                Err(err) => Verification::rejected(err),
            },
            Err(err) => {
                debug!(%err, "rejecting Negotiate token");
                Verification::rejected(err)
            }
        }
    }

    fn accept(&self, token: TokenBuffer) -> Result<(String, TokenBuffer), NegotiateError> {
        let credential = self.credential.lock();
        let mut handshake = Handshake::new(SecurityContext::acceptor(&self.provider), self.settings.max_rounds);
        let Accepted {
            output_token,
            source,
            delegated,
            ..
        } = match handshake.accept(Some(&credential), &token, None) {
            StepOut::Finished(accepted) => accepted,
            StepOut::Continue(_) => return Err(NegotiateError::UnexpectedContinuation),
            StepOut::Failed(err) => return Err(err.into()),
        };
        if let Some(mut delegated) = delegated {
            if let Err(err) = delegated.release() {
                warn!(%err, "failed to release delegated credential");
            }
        }
        if let Err(err) = handshake.into_context().delete() {
            warn!(%err, "failed to delete server security context");
        }
        let identity = source.display()?.text;
        Ok((identity, output_token))
    }

    /// Releases the session's credential. Later calls fail with [`Error::Released`].
    pub fn release(&self) -> Result<(), Error> {
        self.credential.lock().release()
    }
}
