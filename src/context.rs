use std::{cell::Cell, fmt, marker::PhantomData};

use tracing::{debug, trace, warn};

use crate::{
    buffer::TokenBuffer,
    channel_bindings::ChannelBindings,
    credentials::{Credential, CredentialUsage},
    error::ProviderError,
    name::Principal,
    oid::Oid,
    pin::WorkerPin,
    provider::{AcceptContextArgs, ContextStep, InitContextArgs, Provider, RawHandle},
    settings::{ContextFlags, Lifetime},
    step::StepOut,
    Error,
};

mod request;

pub use request::InitiateRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextState {
    Fresh,
    Pending,
    Established,
    /// A step failed. Only deleting the context remains possible.
    Failed,
    Released,
}
impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fresh => "fresh",
            Self::Pending => "pending",
            Self::Established => "established",
            Self::Failed => "failed",
            Self::Released => "released",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Initiator side of a finished handshake.
#[derive(Debug)]
pub struct Initiated {
    /// Final token for the acceptor. Usually empty.
    pub output_token: TokenBuffer,
    pub mechanism: Option<Oid>,
    pub flags: ContextFlags,
    pub lifetime: Lifetime,
}

/// Acceptor side of a finished handshake.
#[derive(Debug)]
pub struct Accepted {
    /// Token for the initiator, present when mutual authentication was requested.
    pub output_token: TokenBuffer,
    pub source: Principal,
    pub mechanism: Option<Oid>,
    pub flags: ContextFlags,
    pub lifetime: Lifetime,
    pub delegated: Option<Credential>,
}

#[derive(Debug)]
pub struct ContextInfo {
    pub source: Option<Principal>,
    pub target: Option<Principal>,
    pub lifetime: Lifetime,
    pub mechanism: Option<Oid>,
    pub flags: ContextFlags,
    pub locally_initiated: bool,
    pub open: bool,
}
impl ContextInfo {
    /// One line describing the context, for diagnostics.
    pub fn summary(&self) -> String {
        let name = |principal: &Option<Principal>| principal.as_ref().map(ToString::to_string).unwrap_or_default();
        let mechanism = self.mechanism.as_ref().map(|oid| format!("{oid:?}")).unwrap_or_default();
        format!(
            "source={} target={} lifetime={} mechanism={} flags={:#x} locally_initiated={} open={}",
            name(&self.source),
            name(&self.target),
            self.lifetime,
            mechanism,
            self.flags.bits(),
            self.locally_initiated,
            self.open,
        )
    }
}

/// One side of a security context.
///
/// Steps take `&mut self`, so a context is never stepped from two places at once. The
/// handle may move to another thread between steps but is not `Sync`.
pub struct SecurityContext {
    provider: Provider,
    role: Role,
    handle: Option<RawHandle>,
    state: ContextState,
    mechanism: Option<Oid>,
    flags: ContextFlags,
    lifetime: Option<Lifetime>,
    peer: Option<Principal>,
    _not_sync: PhantomData<Cell<()>>,
}
impl SecurityContext {
    fn new(provider: &Provider, role: Role) -> Self {
        Self {
            provider: provider.clone(),
            role,
            handle: None,
            state: ContextState::Fresh,
            mechanism: None,
            flags: ContextFlags::empty(),
            lifetime: None,
            peer: None,
            _not_sync: PhantomData,
        }
    }
    pub fn initiator(provider: &Provider) -> Self {
        Self::new(provider, Role::Initiator)
    }
    pub fn acceptor(provider: &Provider) -> Self {
        Self::new(provider, Role::Acceptor)
    }

    /// Runs one initiator round. `input` is the acceptor's last token, absent on the first
    /// round.
    pub fn initiate(&mut self, request: &InitiateRequest<'_>, input: Option<&TokenBuffer>) -> StepOut<Initiated> {
        let _pin = WorkerPin::acquire();
        let args = match self.initiate_args(request, input) {
            Ok(args) => args,
            Err(err) => return StepOut::Failed(err),
        };
        let result = self.provider.init_sec_context(&mut self.handle, args);
        self.finish_step(result).map(|(step, output_token)| Initiated {
            output_token,
            mechanism: step.mechanism,
            flags: step.flags,
            lifetime: step.lifetime,
        })
    }
    fn initiate_args<'a>(
        &self,
        request: &'a InitiateRequest<'_>,
        input: Option<&'a TokenBuffer>,
    ) -> Result<InitContextArgs<'a>, Error> {
        self.check_step(Role::Initiator, "initiate")?;
        let credential = request.credential.map(Credential::raw).transpose()?;
        Ok(InitContextArgs {
            credential,
            target: request.target.raw()?,
            mechanism: request.mechanism.as_ref(),
            flags: request.flags,
            lifetime: request.lifetime,
            channel_bindings: request.channel_bindings.as_ref(),
            input_token: input.map(TokenBuffer::as_bytes),
        })
    }

    /// Runs one acceptor round on the initiator's token.
    pub fn accept(
        &mut self,
        credential: Option<&Credential>,
        input: &TokenBuffer,
        channel_bindings: Option<&ChannelBindings>,
    ) -> StepOut<Accepted> {
        let _pin = WorkerPin::acquire();
        let credential = match self
            .check_step(Role::Acceptor, "accept")
            .and_then(|()| credential.map(Credential::raw).transpose())
        {
            Ok(credential) => credential,
            Err(err) => return StepOut::Failed(err),
        };
        let args = AcceptContextArgs {
            credential,
            input_token: input.as_bytes(),
            channel_bindings,
        };
        let result = self.provider.accept_sec_context(&mut self.handle, args);
        let (step, output_token) = match self.finish_step(result) {
            StepOut::Finished(done) => done,
            StepOut::Continue(token) => return StepOut::Continue(token),
            StepOut::Failed(err) => return StepOut::Failed(err),
        };
        let delegated = step
            .delegated
            .map(|handle| Credential::from_raw(&self.provider, handle, CredentialUsage::Initiate));
        let Some(source) = step.source.map(|handle| Principal::from_raw(&self.provider, handle)) else {
            self.state = ContextState::Failed;
            return StepOut::Failed(ProviderError::failure("provider did not name the initiator").into());
        };
        self.peer = match source.duplicate() {
            Ok(peer) => Some(peer),
            Err(err) => {
                warn!(%err, "could not retain the initiator's name");
                None
            }
        };
        debug!(peer = %source, "accepted security context");
        StepOut::Finished(Accepted {
            output_token,
            source,
            mechanism: step.mechanism,
            flags: step.flags,
            lifetime: step.lifetime,
            delegated,
        })
    }

    fn check_step(&self, role: Role, operation: &'static str) -> Result<(), Error> {
        let valid = self.role == role && matches!(self.state, ContextState::Fresh | ContextState::Pending);
        if !valid {
            return Err(Error::InvalidState {
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    /// Records the provider's answer. Non-finishing steps release any names or credentials
    /// the provider handed back early.
    fn finish_step(&mut self, result: Result<ContextStep, ProviderError>) -> StepOut<(ContextStep, TokenBuffer)> {
        let mut step = match result {
            Ok(step) => step,
            Err(err) => {
                self.state = ContextState::Failed;
                warn!(role = ?self.role, %err, "security context step failed");
                return StepOut::Failed(err.into());
            }
        };
        let output_token = step.output_token.take().map(TokenBuffer::from_provider).unwrap_or_default();
        if self.handle.is_none() {
            self.state = ContextState::Failed;
            return StepOut::Failed(ProviderError::failure("provider returned no context handle").into());
        }
        self.mechanism = step.mechanism.clone().or(self.mechanism.take());
        self.flags = step.flags;
        self.lifetime = Some(step.lifetime);
        if step.continue_needed {
            self.state = ContextState::Pending;
            if let Some(handle) = step.source.take() {
                drop(Principal::from_raw(&self.provider, handle));
            }
            if let Some(handle) = step.delegated.take() {
                drop(Credential::from_raw(&self.provider, handle, CredentialUsage::Initiate));
            }
            trace!(role = ?self.role, len = output_token.len(), "security context needs another round");
            return StepOut::Continue(output_token);
        }
        self.state = ContextState::Established;
        debug!(
            role = ?self.role,
            mech = ?self.mechanism,
            flags = ?self.flags,
            lifetime = %step.lifetime,
            "security context established"
        );
        StepOut::Finished((step, output_token))
    }

    /// Queries the provider for the context's current attributes.
    pub fn inquire(&self) -> Result<ContextInfo, Error> {
        if !matches!(self.state, ContextState::Pending | ContextState::Established) {
            return Err(Error::InvalidState {
                state: self.state,
                operation: "inquire",
            });
        }
        let handle = self.handle.ok_or(Error::Released)?;
        let info = self.provider.inquire_context(handle)?;
        Ok(ContextInfo {
            source: info.source.map(|name| Principal::from_raw(&self.provider, name)),
            target: info.target.map(|name| Principal::from_raw(&self.provider, name)),
            lifetime: info.lifetime,
            mechanism: info.mechanism,
            flags: info.flags,
            locally_initiated: info.locally_initiated,
            open: info.open,
        })
    }

    /// Deletes the context from any state. Deleting again does nothing. The context is
    /// released even when the provider reports a failure.
    pub fn delete(&mut self) -> Result<(), Error> {
        if self.state == ContextState::Released {
            return Ok(());
        }
        let _pin = WorkerPin::acquire();
        self.state = ContextState::Released;
        self.peer = None;
        match self.handle.take() {
            Some(handle) => Ok(self.provider.delete_sec_context(handle)?),
            None => Ok(()),
        }
    }

    pub(crate) fn established_handle(&self, operation: &'static str) -> Result<RawHandle, Error> {
        match (self.state, self.handle) {
            (ContextState::Established, Some(handle)) => Ok(handle),
            (state, _) => Err(Error::InvalidState { state, operation }),
        }
    }
    pub(crate) fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn state(&self) -> ContextState {
        self.state
    }
    pub fn role(&self) -> Role {
        self.role
    }
    pub fn is_established(&self) -> bool {
        self.state == ContextState::Established
    }
    pub fn mechanism(&self) -> Option<&Oid> {
        self.mechanism.as_ref()
    }
    pub fn flags(&self) -> ContextFlags {
        self.flags
    }
    pub fn lifetime(&self) -> Option<Lifetime> {
        self.lifetime
    }
    /// The authenticated initiator, on an established acceptor context.
    pub fn peer(&self) -> Option<&Principal> {
        self.peer.as_ref()
    }
    pub fn is_mutually_authenticated(&self) -> bool {
        self.flags.contains(ContextFlags::MUTUAL_AUTH)
    }
}
impl Drop for SecurityContext {
    fn drop(&mut self) {
        if let Err(err) = self.delete() {
            warn!(%err, "failed to delete security context");
        }
    }
}
impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("mechanism", &self.mechanism)
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        error::MajorStatus,
        loopback::{LoopbackConfig, LoopbackProvider, LOOPBACK_MECH},
        oid::{GSS_C_NT_HOSTBASED_SERVICE, GSS_C_NT_USER_NAME},
    };

    struct Fixture {
        loopback: Arc<LoopbackProvider>,
        provider: Provider,
        target: Principal,
        client_cred: Credential,
        server_cred: Credential,
    }
    fn fixture(config: LoopbackConfig) -> Fixture {
        let loopback = Arc::new(LoopbackProvider::with_config(config));
        let provider: Provider = loopback.clone();
        let target = Principal::parse(&provider, "HTTP@www.example.com", &GSS_C_NT_HOSTBASED_SERVICE).unwrap();
        let client = Principal::parse(&provider, "alice@EXAMPLE.COM", &GSS_C_NT_USER_NAME).unwrap();
        let client_cred = Credential::outbound(&provider, Some(&client)).unwrap();
        let server_cred = Credential::inbound(&provider, Some(&target)).unwrap();
        Fixture {
            loopback,
            provider,
            target,
            client_cred,
            server_cred,
        }
    }

    #[test]
    fn single_round_without_mutual_auth() {
        let f = fixture(LoopbackConfig::default());
        let mut client = SecurityContext::initiator(&f.provider);
        let mut server = SecurityContext::acceptor(&f.provider);
        let request = InitiateRequest::new(&f.target).with_credential(&f.client_cred);

        let StepOut::Finished(initiated) = client.initiate(&request, None) else {
            panic!("initiator should finish in one round");
        };
        assert!(!initiated.output_token.is_empty());
        assert_eq!(initiated.mechanism, Some(LOOPBACK_MECH));
        assert!(client.is_established());

        let StepOut::Finished(accepted) = server.accept(Some(&f.server_cred), &initiated.output_token, None) else {
            panic!("acceptor should finish in one round");
        };
        assert!(accepted.output_token.is_empty());
        assert_eq!(accepted.source.to_string(), "alice@EXAMPLE.COM");
        assert_eq!(server.peer().unwrap().to_string(), "alice@EXAMPLE.COM");
        assert_eq!(server.mechanism(), Some(&LOOPBACK_MECH));
        assert!(accepted.delegated.is_none());
    }

    #[test]
    fn mutual_auth_takes_a_reply() {
        let f = fixture(LoopbackConfig::default());
        let mut client = SecurityContext::initiator(&f.provider);
        let mut server = SecurityContext::acceptor(&f.provider);
        let request = InitiateRequest::new(&f.target).request_mutual_auth();

        let StepOut::Continue(token) = client.initiate(&request, None) else {
            panic!("initiator should wait for the acceptor");
        };
        assert_eq!(client.state(), ContextState::Pending);
        let StepOut::Finished(accepted) = server.accept(Some(&f.server_cred), &token, None) else {
            panic!("acceptor should finish");
        };
        assert!(!accepted.output_token.is_empty());
        assert!(accepted.flags.contains(ContextFlags::MUTUAL_AUTH));

        let StepOut::Finished(initiated) = client.initiate(&request, Some(&accepted.output_token)) else {
            panic!("initiator should finish on the reply");
        };
        assert!(initiated.output_token.is_empty());
        assert!(client.is_mutually_authenticated());
    }

    #[test]
    fn finished_context_cannot_step_again() {
        let f = fixture(LoopbackConfig::default());
        let mut client = SecurityContext::initiator(&f.provider);
        let request = InitiateRequest::new(&f.target);
        assert!(client.initiate(&request, None).is_finished());
        let StepOut::Failed(err) = client.initiate(&request, None) else {
            panic!("second initiate must fail");
        };
        assert!(matches!(
            err,
            Error::InvalidState {
                state: ContextState::Established,
                operation: "initiate"
            }
        ));
        assert!(client.is_established());
    }

    #[test]
    fn acceptor_rejects_initiate() {
        let f = fixture(LoopbackConfig::default());
        let mut server = SecurityContext::acceptor(&f.provider);
        let StepOut::Failed(err) = server.initiate(&InitiateRequest::new(&f.target), None) else {
            panic!("acceptor cannot initiate");
        };
        assert!(matches!(err, Error::InvalidState { state: ContextState::Fresh, .. }));
        assert_eq!(server.state(), ContextState::Fresh);
    }

    #[test]
    fn malformed_token_fails_and_stays_deletable() {
        let f = fixture(LoopbackConfig::default());
        let mut server = SecurityContext::acceptor(&f.provider);
        let StepOut::Failed(err) = server.accept(Some(&f.server_cred), &TokenBuffer::from_bytes(b"garbage"), None)
        else {
            panic!("garbage must not be accepted");
        };
        assert!(matches!(err, Error::Provider(ref e) if e.major == MajorStatus::DEFECTIVE_TOKEN));
        assert_eq!(server.state(), ContextState::Failed);
        assert!(matches!(server.inquire(), Err(Error::InvalidState { .. })));
        server.delete().unwrap();
        server.delete().unwrap();
        assert_eq!(server.state(), ContextState::Released);
        drop(server);
        drop(f.server_cred);
        drop(f.client_cred);
        drop(f.target);
        assert_eq!(f.loopback.live_handles(), 0);
    }

    #[test]
    fn released_target_fails_before_the_provider() {
        let mut f = fixture(LoopbackConfig::default());
        let mut client = SecurityContext::initiator(&f.provider);
        let mut target = f.target.duplicate().unwrap();
        target.release().unwrap();
        let StepOut::Failed(err) = client.initiate(&InitiateRequest::new(&target), None) else {
            panic!("released target must fail");
        };
        assert!(matches!(err, Error::Released));
        assert_eq!(client.state(), ContextState::Fresh);
        f.client_cred.release().unwrap();
        let request = InitiateRequest::new(&f.target).with_credential(&f.client_cred);
        let StepOut::Failed(err) = client.initiate(&request, None) else {
            panic!("released credential must fail");
        };
        assert!(matches!(err, Error::Released));
    }

    #[test]
    fn inquire_reports_both_ends() {
        let f = fixture(LoopbackConfig::default());
        let mut client = SecurityContext::initiator(&f.provider);
        let request = InitiateRequest::new(&f.target)
            .with_credential(&f.client_cred)
            .request_mutual_auth();
        assert!(matches!(client.inquire(), Err(Error::InvalidState { state: ContextState::Fresh, .. })));
        assert!(client.initiate(&request, None).is_continue());

        let info = client.inquire().unwrap();
        assert!(info.locally_initiated);
        assert!(!info.open);
        assert_eq!(info.source.as_ref().unwrap().to_string(), "alice@EXAMPLE.COM");
        let summary = info.summary();
        assert!(summary.contains("source=alice@EXAMPLE.COM"), "{summary}");
        assert!(summary.contains("open=false"), "{summary}");
    }

    #[test]
    fn inquire_an_established_acceptor() {
        let f = fixture(LoopbackConfig::default());
        let mut client = SecurityContext::initiator(&f.provider);
        let mut server = SecurityContext::acceptor(&f.provider);
        let request = InitiateRequest::new(&f.target)
            .with_credential(&f.client_cred)
            .request_encryption();
        let StepOut::Finished(initiated) = client.initiate(&request, None) else {
            panic!("single round");
        };
        assert!(server
            .accept(Some(&f.server_cred), &initiated.output_token, None)
            .is_finished());

        let info = server.inquire().unwrap();
        assert!(info.open);
        assert!(!info.locally_initiated);
        assert_eq!(info.source.as_ref().unwrap().to_string(), "alice@EXAMPLE.COM");
        assert_eq!(info.target.as_ref().unwrap().to_string(), "HTTP/www.example.com");
        assert_eq!(info.mechanism, Some(LOOPBACK_MECH));
        assert!(info.flags.contains(ContextFlags::CONFIDENTIALITY));
        let summary = info.summary();
        assert!(summary.contains("source=alice@EXAMPLE.COM target=HTTP/www.example.com"), "{summary}");
        assert!(summary.contains("locally_initiated=false open=true"), "{summary}");

        assert!(client.inquire().unwrap().open);
    }

    #[test]
    fn dropping_a_pending_context_deletes_it() {
        let f = fixture(LoopbackConfig::default().with_rounds(3));
        let mut client = SecurityContext::initiator(&f.provider);
        let token = match client.initiate(&InitiateRequest::new(&f.target), None) {
            StepOut::Continue(token) => token,
            other => panic!("expected continuation, got {other:?}"),
        };
        let before = f.loopback.live_handles();
        drop(client);
        assert_eq!(f.loopback.live_handles(), before - 1);
        drop(token);
        assert_eq!(f.loopback.outstanding_buffers(), 0);
    }
}
