//! A deterministic in-process security provider.
//!
//! The loopback mechanism authenticates nobody: it carries the initiator's and target's
//! names in clear tokens and derives its "session key" from them. What it does reproduce
//! faithfully is the shape of a real mechanism: multi-round handshakes, mutual
//! authentication replies, delegation, channel binding checks, exported names, and
//! provider-owned memory that must be handed back. It counts every handle and buffer it
//! gives out so tests can assert that nothing leaks.

use std::{
    collections::HashMap,
    num::NonZeroU64,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    buffer::ProviderAllocation,
    credentials::CredentialUsage,
    error::{MajorStatus, ProviderError},
    oid::{
        Oid, OidSet, GSS_C_NT_EXPORT_NAME, GSS_C_NT_HOSTBASED_SERVICE, GSS_C_NT_HOSTBASED_SERVICE_X,
        GSS_C_NT_STRING_UID_NAME, GSS_C_NT_USER_NAME, GSS_KRB5_NT_PRINCIPAL, GSS_KRB5_NT_PRINCIPAL_NAME,
    },
    pin,
    provider::{
        AcceptContextArgs, AcquiredCredential, AddedCredential, ContextStep, InitContextArgs, RawContextInfo,
        RawCredentialInfo, RawDisplayName, RawHandle, RawMechanismCredentialInfo, RawUnwrapped, RawWrapped,
        SecurityProvider,
    },
    settings::{requested_secs, ContextFlags, Lifetime, Qop},
};

mod token;

use token::{Init, Reader, Token};

/// `1.3.6.1.4.1.32473.1`, under the enterprise number reserved for documentation.
pub const LOOPBACK_MECH: Oid = Oid::from_static(b"\x2b\x06\x01\x04\x01\x81\xfd\x59\x01");

const SUPPORTED_FLAGS: ContextFlags = ContextFlags::DELEGATION
    .union(ContextFlags::MUTUAL_AUTH)
    .union(ContextFlags::REPLAY_DETECTION)
    .union(ContextFlags::SEQUENCING)
    .union(ContextFlags::CONFIDENTIALITY)
    .union(ContextFlags::INTEGRITY);

const MAX_QOP: Qop = Qop(1);

#[derive(Clone, Debug)]
pub struct LoopbackConfig {
    rounds: u32,
    mechanisms: OidSet,
    default_principal: String,
    acceptors: Option<Vec<String>>,
    credential_lifetime: Lifetime,
    context_lifetime: Lifetime,
    empty_initiator_token: bool,
    failing_releases: bool,
    confidentiality: bool,
}
impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            rounds: 1,
            mechanisms: [LOOPBACK_MECH].into_iter().collect(),
            default_principal: "user@LOOPBACK".to_owned(),
            acceptors: None,
            credential_lifetime: Lifetime::Bounded(Duration::from_secs(10 * 60 * 60)),
            context_lifetime: Lifetime::Bounded(Duration::from_secs(60 * 60)),
            empty_initiator_token: false,
            failing_releases: false,
            confidentiality: true,
        }
    }
}
impl LoopbackConfig {
    /// Number of initiator tokens a handshake takes. At least one.
    #[must_use]
    pub fn with_rounds(self, rounds: u32) -> Self {
        Self {
            rounds: rounds.max(1),
            ..self
        }
    }
    /// Accepts `mechanism` as an additional credential element.
    #[must_use]
    pub fn with_mechanism(mut self, mechanism: Oid) -> Self {
        self.mechanisms.add(mechanism);
        self
    }
    #[must_use]
    pub fn with_default_principal(self, principal: impl Into<String>) -> Self {
        Self {
            default_principal: principal.into(),
            ..self
        }
    }
    /// Restricts accepting credentials to these principals, as if only they had keys.
    #[must_use]
    pub fn with_acceptors(self, principals: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            acceptors: Some(principals.into_iter().map(Into::into).collect()),
            ..self
        }
    }
    /// The initiator finishes at once with an empty token.
    #[must_use]
    pub fn empty_initiator_token(self) -> Self {
        Self {
            empty_initiator_token: true,
            ..self
        }
    }
    /// Every release reports a failure, after freeing the resource.
    #[must_use]
    pub fn failing_releases(self) -> Self {
        Self {
            failing_releases: true,
            ..self
        }
    }
    /// Never grants confidentiality, so wrapping downgrades to integrity only.
    #[must_use]
    pub fn without_confidentiality(self) -> Self {
        Self {
            confidentiality: false,
            ..self
        }
    }
}

#[derive(Clone, Debug)]
struct NameEntry {
    display: String,
    name_type: Oid,
    canonical: String,
    mechanism: Option<Oid>,
}

#[derive(Clone, Debug)]
struct Element {
    mechanism: Oid,
    usage: CredentialUsage,
    initiator_lifetime: Lifetime,
    acceptor_lifetime: Lifetime,
}

#[derive(Clone, Debug)]
struct CredentialEntry {
    principal: String,
    elements: Vec<Element>,
}
impl CredentialEntry {
    fn usage(&self) -> CredentialUsage {
        let initiate = self.elements.iter().any(|e| e.usage.can_initiate());
        let accept = self.elements.iter().any(|e| e.usage.can_accept());
        match (initiate, accept) {
            (true, true) => CredentialUsage::Both,
            (false, true) => CredentialUsage::Accept,
            _ => CredentialUsage::Initiate,
        }
    }
    fn mechanisms(&self) -> OidSet {
        self.elements.iter().map(|e| e.mechanism.clone()).collect()
    }
    fn lifetime(&self) -> Lifetime {
        self.elements
            .first()
            .map(|e| match e.usage {
                CredentialUsage::Accept => e.acceptor_lifetime,
                _ => e.initiator_lifetime,
            })
            .unwrap_or(Lifetime::Bounded(Duration::ZERO))
    }
}

#[derive(Clone, Debug, Default)]
struct ContextEntry {
    locally_initiated: bool,
    initiator: String,
    target: String,
    flags: ContextFlags,
    round: u32,
    awaiting_final: bool,
    open: bool,
    key: u64,
    lifetime: Option<Lifetime>,
}

#[derive(Debug)]
struct State {
    next: NonZeroU64,
    names: HashMap<RawHandle, NameEntry>,
    credentials: HashMap<RawHandle, CredentialEntry>,
    contexts: HashMap<RawHandle, ContextEntry>,
}
impl State {
    fn next_handle(&mut self) -> RawHandle {
        self.next = self.next.saturating_add(1);
        RawHandle::from(self.next)
    }
    fn add_name(&mut self, entry: NameEntry) -> RawHandle {
        let handle = self.next_handle();
        self.names.insert(handle, entry);
        handle
    }
    fn add_mechanism_name(&mut self, principal: &str) -> RawHandle {
        self.add_name(NameEntry {
            display: principal.to_owned(),
            name_type: GSS_KRB5_NT_PRINCIPAL_NAME,
            canonical: principal.to_owned(),
            mechanism: Some(LOOPBACK_MECH),
        })
    }
    fn add_credential(&mut self, entry: CredentialEntry) -> RawHandle {
        let handle = self.next_handle();
        self.credentials.insert(handle, entry);
        handle
    }
    fn name(&self, handle: RawHandle) -> Result<&NameEntry, ProviderError> {
        self.names
            .get(&handle)
            .ok_or_else(|| ProviderError::new(MajorStatus::BAD_NAME, 0, "unknown name handle"))
    }
    fn credential(&self, handle: RawHandle) -> Result<&CredentialEntry, ProviderError> {
        self.credentials
            .get(&handle)
            .ok_or_else(|| ProviderError::new(MajorStatus::NO_CRED, 0, "unknown credential handle"))
    }
    fn context(&self, handle: RawHandle) -> Result<&ContextEntry, ProviderError> {
        self.contexts.get(&handle).ok_or_else(no_context)
    }
}

fn no_context() -> ProviderError {
    ProviderError::new(MajorStatus::NO_CONTEXT, 0, "unknown security context")
}

/// See the [module documentation](self).
#[derive(Debug)]
pub struct LoopbackProvider {
    config: LoopbackConfig,
    state: Mutex<State>,
    outstanding: Arc<AtomicUsize>,
}
impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}
impl LoopbackProvider {
    pub fn new() -> Self {
        Self::with_config(LoopbackConfig::default())
    }
    pub fn with_config(config: LoopbackConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                next: NonZeroU64::MIN,
                names: HashMap::new(),
                credentials: HashMap::new(),
                contexts: HashMap::new(),
            }),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }
    /// Provider buffers handed out and not yet released.
    pub fn outstanding_buffers(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
    /// Names, credentials and contexts not yet released.
    pub fn live_handles(&self) -> usize {
        let state = self.state.lock();
        state.names.len() + state.credentials.len() + state.contexts.len()
    }
    /// Handles created since construction, released or not.
    pub fn issued_handles(&self) -> u64 {
        self.state.lock().next.get() - 1
    }

    fn allocate(&self, data: Vec<u8>) -> Box<dyn ProviderAllocation> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Box::new(LoopbackBuffer {
            data,
            outstanding: self.outstanding.clone(),
            failing_release: self.config.failing_releases,
        })
    }
    fn released(&self, what: &str) -> Result<(), ProviderError> {
        if self.config.failing_releases {
            return Err(ProviderError::failure(format!("refusing to release {what}")));
        }
        Ok(())
    }
    fn require_pin(operation: &str) -> Result<(), ProviderError> {
        if !pin::is_pinned() {
            return Err(ProviderError::failure(format!("{operation} called outside a pinned worker")));
        }
        Ok(())
    }
    fn check_mechanism(&self, mechanism: &Oid) -> Result<(), ProviderError> {
        if !self.config.mechanisms.contains(mechanism) {
            return Err(ProviderError::new(
                MajorStatus::BAD_MECH,
                0,
                format!("mechanism {mechanism} is not supported"),
            ));
        }
        Ok(())
    }
    fn check_acceptor(&self, principal: &str) -> Result<(), ProviderError> {
        match &self.config.acceptors {
            Some(acceptors) if !acceptors.iter().any(|a| a == principal) => Err(ProviderError::new(
                MajorStatus::NO_CRED,
                0,
                format!("no key material for {principal}"),
            )),
            _ => Ok(()),
        }
    }
    fn granted(&self, requested: ContextFlags) -> ContextFlags {
        let mut granted = requested & SUPPORTED_FLAGS;
        if !self.config.confidentiality {
            granted.remove(ContextFlags::CONFIDENTIALITY);
        }
        granted
    }
    fn lifetime_or_default(requested: Option<Lifetime>, default: Lifetime) -> Lifetime {
        match requested {
            None => default,
            Some(requested) => Lifetime::from_secs(requested_secs(Some(requested))),
        }
    }
    fn open_context(&self, handle: RawHandle) -> Result<ContextEntry, ProviderError> {
        let state = self.state.lock();
        let context = state.context(handle)?;
        if !context.open {
            return Err(ProviderError::new(MajorStatus::NO_CONTEXT, 0, "security context is not established"));
        }
        Ok(context.clone())
    }

    /// Emits the initiator token for the context's next round.
    fn next_init(&self, context: &mut ContextEntry) -> Result<(bool, Vec<u8>), ProviderError> {
        context.round += 1;
        let token = Token::Init(Init {
            round: context.round,
            flags: context.flags,
            initiator: context.initiator.clone(),
            target: context.target.clone(),
            bindings: Vec::new(),
        });
        let last = context.round >= self.config.rounds;
        let mutual = context.flags.contains(ContextFlags::MUTUAL_AUTH);
        context.awaiting_final = last && mutual;
        context.open = last && !mutual;
        Ok((!context.open, token.encode()?))
    }
}

struct LoopbackBuffer {
    data: Vec<u8>,
    outstanding: Arc<AtomicUsize>,
    failing_release: bool,
}
impl ProviderAllocation for LoopbackBuffer {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
    fn release(self: Box<Self>) -> Result<(), ProviderError> {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if self.failing_release {
            return Err(ProviderError::failure("refusing to release buffer"));
        }
        Ok(())
    }
}

fn session_key(initiator: &str, target: &str) -> u64 {
    token::digest(&[initiator.as_bytes(), &[0], target.as_bytes()])
}

fn mac(key: u64, qop: Qop, message: &[u8]) -> u64 {
    token::digest(&[&key.to_be_bytes(), &qop.0.to_be_bytes(), message])
}

fn check_qop(qop: Qop) -> Result<(), ProviderError> {
    if qop > MAX_QOP {
        return Err(ProviderError::new(MajorStatus::BAD_QOP, 0, format!("{qop} is not supported")));
    }
    Ok(())
}

fn bad_mic() -> ProviderError {
    ProviderError::new(MajorStatus::BAD_MIC, 0, "message integrity check failed")
}

/// Turns an importable name into the `primary/instance@REALM` form names are compared in.
fn canonical_name(text: &str, name_type: &Oid) -> Result<(String, Option<Oid>), ProviderError> {
    let kerberos_like = [
        GSS_C_NT_USER_NAME,
        GSS_C_NT_STRING_UID_NAME,
        GSS_KRB5_NT_PRINCIPAL_NAME,
        GSS_KRB5_NT_PRINCIPAL,
    ];
    if kerberos_like.contains(name_type) {
        return Ok((text.to_owned(), None));
    }
    if *name_type == GSS_C_NT_HOSTBASED_SERVICE || *name_type == GSS_C_NT_HOSTBASED_SERVICE_X {
        let (service, host) = text.split_once('@').unwrap_or((text, "localhost"));
        if service.is_empty() || host.is_empty() {
            return Err(ProviderError::new(MajorStatus::BAD_NAME, 0, "malformed host-based service name"));
        }
        return Ok((format!("{service}/{host}"), None));
    }
    Err(ProviderError::new(
        MajorStatus::BAD_NAMETYPE,
        0,
        format!("name type {name_type} is not supported"),
    ))
}

impl SecurityProvider for LoopbackProvider {
    fn acquire_credential(
        &self,
        name: Option<RawHandle>,
        lifetime: Option<Lifetime>,
        mechanisms: Option<&OidSet>,
        usage: CredentialUsage,
    ) -> Result<AcquiredCredential, ProviderError> {
        let mut state = self.state.lock();
        let principal = match name {
            Some(name) => state.name(name)?.canonical.clone(),
            None => self.config.default_principal.clone(),
        };
        let mechanisms: Vec<Oid> = match mechanisms {
            Some(desired) => desired
                .iter()
                .filter(|m| self.config.mechanisms.contains(m))
                .cloned()
                .collect(),
            None => self.config.mechanisms.iter().cloned().collect(),
        };
        if mechanisms.is_empty() {
            return Err(ProviderError::new(MajorStatus::BAD_MECH, 0, "none of the desired mechanisms is supported"));
        }
        if usage.can_accept() {
            self.check_acceptor(&principal)?;
        }
        let lifetime = Self::lifetime_or_default(lifetime, self.config.credential_lifetime);
        let elements = mechanisms
            .into_iter()
            .map(|mechanism| element(mechanism, usage, lifetime, lifetime))
            .collect();
        let entry = CredentialEntry { principal, elements };
        let mechanisms = entry.mechanisms();
        let handle = state.add_credential(entry);
        Ok(AcquiredCredential {
            handle,
            mechanisms,
            lifetime,
        })
    }

    fn add_credential(
        &self,
        credential: RawHandle,
        name: Option<RawHandle>,
        mechanism: &Oid,
        usage: CredentialUsage,
        initiator_lifetime: Option<Lifetime>,
        acceptor_lifetime: Option<Lifetime>,
    ) -> Result<AddedCredential, ProviderError> {
        self.check_mechanism(mechanism)?;
        let mut state = self.state.lock();
        let mut entry = state.credential(credential)?.clone();
        if let Some(name) = name {
            let principal = &state.name(name)?.canonical;
            if *principal != entry.principal {
                return Err(ProviderError::new(MajorStatus::BAD_NAME, 0, "credential belongs to another principal"));
            }
        }
        if entry.elements.iter().any(|e| e.mechanism == *mechanism) {
            return Err(ProviderError::new(
                MajorStatus::DUPLICATE_ELEMENT,
                0,
                format!("credential already holds {mechanism}"),
            ));
        }
        if usage.can_accept() {
            self.check_acceptor(&entry.principal)?;
        }
        let initiator_lifetime = Self::lifetime_or_default(initiator_lifetime, self.config.credential_lifetime);
        let acceptor_lifetime = Self::lifetime_or_default(acceptor_lifetime, self.config.credential_lifetime);
        let added = element(mechanism.clone(), usage, initiator_lifetime, acceptor_lifetime);
        let (initiator_lifetime, acceptor_lifetime) = (added.initiator_lifetime, added.acceptor_lifetime);
        entry.elements.push(added);
        let mechanisms = entry.mechanisms();
        let handle = state.add_credential(entry);
        Ok(AddedCredential {
            handle,
            mechanisms,
            initiator_lifetime,
            acceptor_lifetime,
        })
    }

    fn inquire_credential(&self, credential: RawHandle) -> Result<RawCredentialInfo, ProviderError> {
        let mut state = self.state.lock();
        let entry = state.credential(credential)?.clone();
        let name = state.add_mechanism_name(&entry.principal);
        Ok(RawCredentialInfo {
            name: Some(name),
            lifetime: entry.lifetime(),
            usage: entry.usage(),
            mechanisms: entry.mechanisms(),
        })
    }

    fn inquire_credential_by_mech(
        &self,
        credential: RawHandle,
        mechanism: &Oid,
    ) -> Result<RawMechanismCredentialInfo, ProviderError> {
        let mut state = self.state.lock();
        let entry = state.credential(credential)?;
        let Some(found) = entry.elements.iter().find(|e| e.mechanism == *mechanism).cloned() else {
            return Err(ProviderError::new(
                MajorStatus::BAD_MECH,
                0,
                format!("credential has no element for {mechanism}"),
            ));
        };
        let principal = entry.principal.clone();
        let name = state.add_mechanism_name(&principal);
        Ok(RawMechanismCredentialInfo {
            name: Some(name),
            initiator_lifetime: found.initiator_lifetime,
            acceptor_lifetime: found.acceptor_lifetime,
            usage: found.usage,
        })
    }

    fn release_credential(&self, credential: RawHandle) -> Result<(), ProviderError> {
        if self.state.lock().credentials.remove(&credential).is_none() {
            return Err(ProviderError::new(MajorStatus::NO_CRED, 0, "unknown credential handle"));
        }
        self.released("credential")
    }

    fn init_sec_context(
        &self,
        context: &mut Option<RawHandle>,
        args: InitContextArgs<'_>,
    ) -> Result<ContextStep, ProviderError> {
        Self::require_pin("init_sec_context")?;
        let mut state = self.state.lock();
        let handle = match *context {
            Some(handle) => handle,
            None => {
                let handle = state.next_handle();
                state.contexts.insert(
                    handle,
                    ContextEntry {
                        locally_initiated: true,
                        ..ContextEntry::default()
                    },
                );
                *context = Some(handle);
                handle
            }
        };
        let mut entry = state.context(handle)?.clone();
        if !entry.locally_initiated || entry.open {
            return Err(no_context());
        }
        let mut output = None;
        let continue_needed = if entry.round == 0 {
            if args.input_token.is_some_and(|t| !t.is_empty()) {
                return Err(ProviderError::new(MajorStatus::DEFECTIVE_TOKEN, 0, "unexpected input token"));
            }
            if let Some(mechanism) = args.mechanism {
                self.check_mechanism(mechanism)?;
            }
            entry.target = state.name(args.target)?.canonical.clone();
            entry.initiator = match args.credential {
                Some(credential) => {
                    let credential = state.credential(credential)?;
                    if !credential.usage().can_initiate() {
                        return Err(ProviderError::new(MajorStatus::NO_CRED, 0, "credential cannot initiate"));
                    }
                    credential.principal.clone()
                }
                None => self.config.default_principal.clone(),
            };
            entry.flags = self.granted(args.flags);
            entry.key = session_key(&entry.initiator, &entry.target);
            entry.lifetime = Some(Self::lifetime_or_default(args.lifetime, self.config.context_lifetime));
            if self.config.empty_initiator_token {
                entry.open = true;
                output = Some(Vec::new());
                false
            } else {
                let (continue_needed, mut token) = self.next_init(&mut entry)?;
                if let Some(bindings) = args.channel_bindings {
                    token = rebind(&token, bindings.application_data())?;
                }
                output = Some(token);
                continue_needed
            }
        } else {
            let input = args
                .input_token
                .ok_or_else(|| ProviderError::new(MajorStatus::DEFECTIVE_TOKEN, 0, "missing acceptor token"))?;
            match Token::decode(input)? {
                Token::Final if entry.awaiting_final => {
                    entry.open = true;
                    entry.awaiting_final = false;
                    false
                }
                Token::Reply { round } if !entry.awaiting_final && round == entry.round => {
                    let (continue_needed, mut token) = self.next_init(&mut entry)?;
                    if let Some(bindings) = args.channel_bindings {
                        token = rebind(&token, bindings.application_data())?;
                    }
                    output = Some(token);
                    continue_needed
                }
                _ => return Err(ProviderError::new(MajorStatus::DEFECTIVE_TOKEN, 0, "out of sequence token")),
            }
        };
        if entry.open {
            entry.flags |= ContextFlags::PROTECTION_READY | ContextFlags::TRANSFERABLE;
        }
        let step = ContextStep {
            continue_needed,
            output_token: output.map(|token| self.allocate(token)),
            mechanism: Some(LOOPBACK_MECH),
            flags: entry.flags,
            lifetime: entry.lifetime.unwrap_or(self.config.context_lifetime),
            source: None,
            delegated: None,
        };
        trace!(round = entry.round, continue_needed, "loopback initiator step");
        state.contexts.insert(handle, entry);
        Ok(step)
    }

    fn accept_sec_context(
        &self,
        context: &mut Option<RawHandle>,
        args: AcceptContextArgs<'_>,
    ) -> Result<ContextStep, ProviderError> {
        Self::require_pin("accept_sec_context")?;
        let mut state = self.state.lock();
        let handle = match *context {
            Some(handle) => handle,
            None => {
                let handle = state.next_handle();
                state.contexts.insert(handle, ContextEntry::default());
                *context = Some(handle);
                handle
            }
        };
        let mut entry = state.context(handle)?.clone();
        if entry.locally_initiated || entry.open {
            return Err(no_context());
        }
        let Token::Init(init) = Token::decode(args.input_token)? else {
            return Err(ProviderError::new(MajorStatus::DEFECTIVE_TOKEN, 0, "expected an initiator token"));
        };
        if entry.round == 0 {
            if init.round != 1 {
                return Err(ProviderError::new(MajorStatus::DEFECTIVE_TOKEN, 0, "handshake must start at round 1"));
            }
            if let Some(credential) = args.credential {
                let credential = state.credential(credential)?;
                if !credential.usage().can_accept() {
                    return Err(ProviderError::new(MajorStatus::NO_CRED, 0, "credential cannot accept"));
                }
                if credential.principal != init.target {
                    return Err(ProviderError::new(
                        MajorStatus::FAILURE,
                        1,
                        format!("token is for {}, not {}", init.target, credential.principal),
                    ));
                }
            }
            if let Some(bindings) = args.channel_bindings {
                if bindings.application_data() != init.bindings.as_slice() {
                    return Err(ProviderError::new(MajorStatus::BAD_BINDINGS, 0, "channel bindings differ"));
                }
            }
            entry.initiator = init.initiator;
            entry.target = init.target;
            entry.flags = self.granted(init.flags);
            entry.key = session_key(&entry.initiator, &entry.target);
            entry.lifetime = Some(self.config.context_lifetime);
        } else if init.round != entry.round + 1 || init.initiator != entry.initiator || init.target != entry.target {
            return Err(ProviderError::new(MajorStatus::DEFECTIVE_TOKEN, 0, "out of sequence token"));
        }
        entry.round = init.round;

        let mut step = ContextStep {
            continue_needed: false,
            output_token: None,
            mechanism: Some(LOOPBACK_MECH),
            flags: entry.flags,
            lifetime: entry.lifetime.unwrap_or(self.config.context_lifetime),
            source: None,
            delegated: None,
        };
        if entry.round < self.config.rounds {
            step.continue_needed = true;
            step.output_token = Some(self.allocate(Token::Reply { round: entry.round }.encode()?));
        } else {
            entry.open = true;
            entry.flags |= ContextFlags::PROTECTION_READY | ContextFlags::TRANSFERABLE;
            step.flags = entry.flags;
            if entry.flags.contains(ContextFlags::MUTUAL_AUTH) {
                step.output_token = Some(self.allocate(Token::Final.encode()?));
            }
            step.source = Some(state.add_mechanism_name(&entry.initiator));
            if entry.flags.contains(ContextFlags::DELEGATION) {
                let lifetime = self.config.credential_lifetime;
                step.delegated = Some(state.add_credential(CredentialEntry {
                    principal: entry.initiator.clone(),
                    elements: vec![element(LOOPBACK_MECH, CredentialUsage::Initiate, lifetime, lifetime)],
                }));
            }
        }
        trace!(round = entry.round, continue_needed = step.continue_needed, "loopback acceptor step");
        state.contexts.insert(handle, entry);
        Ok(step)
    }

    fn delete_sec_context(&self, context: RawHandle) -> Result<(), ProviderError> {
        Self::require_pin("delete_sec_context")?;
        if self.state.lock().contexts.remove(&context).is_none() {
            return Err(no_context());
        }
        self.released("security context")
    }

    fn inquire_context(&self, context: RawHandle) -> Result<RawContextInfo, ProviderError> {
        let mut state = self.state.lock();
        let entry = state.context(context)?.clone();
        let (initiator, target) = (entry.initiator.clone(), entry.target.clone());
        let source = (!initiator.is_empty()).then(|| state.add_mechanism_name(&initiator));
        let target = (!target.is_empty()).then(|| state.add_mechanism_name(&target));
        Ok(RawContextInfo {
            source,
            target,
            lifetime: entry.lifetime.unwrap_or(self.config.context_lifetime),
            mechanism: Some(LOOPBACK_MECH),
            flags: entry.flags,
            locally_initiated: entry.locally_initiated,
            open: entry.open,
        })
    }

    fn import_name(&self, name: &[u8], name_type: &Oid) -> Result<RawHandle, ProviderError> {
        let entry = if *name_type == GSS_C_NT_EXPORT_NAME {
            let (mechanism, principal) = token::import_exported_name(name)?;
            self.check_mechanism(&mechanism)?;
            NameEntry {
                display: principal.clone(),
                name_type: GSS_KRB5_NT_PRINCIPAL_NAME,
                canonical: principal,
                mechanism: Some(mechanism),
            }
        } else {
            let text = std::str::from_utf8(name)
                .map_err(|_| ProviderError::new(MajorStatus::BAD_NAME, 0, "name is not UTF-8"))?;
            if text.is_empty() {
                return Err(ProviderError::new(MajorStatus::BAD_NAME, 0, "name is empty"));
            }
            let (canonical, mechanism) = canonical_name(text, name_type)?;
            NameEntry {
                display: text.to_owned(),
                name_type: name_type.clone(),
                canonical,
                mechanism,
            }
        };
        Ok(self.state.lock().add_name(entry))
    }

    fn canonicalize_name(&self, name: RawHandle, mechanism: &Oid) -> Result<RawHandle, ProviderError> {
        self.check_mechanism(mechanism)?;
        let mut state = self.state.lock();
        let entry = NameEntry {
            mechanism: Some(mechanism.clone()),
            ..state.name(name)?.clone()
        };
        Ok(state.add_name(entry))
    }

    fn compare_name(&self, first: RawHandle, second: RawHandle) -> Result<bool, ProviderError> {
        let state = self.state.lock();
        Ok(state.name(first)?.canonical == state.name(second)?.canonical)
    }

    fn display_name(&self, name: RawHandle) -> Result<RawDisplayName, ProviderError> {
        let state = self.state.lock();
        let entry = state.name(name)?;
        Ok(RawDisplayName {
            text: entry.display.clone(),
            name_type: Some(entry.name_type.clone()),
        })
    }

    fn export_name(&self, name: RawHandle) -> Result<Box<dyn ProviderAllocation>, ProviderError> {
        let exported = {
            let state = self.state.lock();
            let entry = state.name(name)?;
            let Some(mechanism) = &entry.mechanism else {
                return Err(ProviderError::new(MajorStatus::NAME_NOT_MN, 0, "name is not a mechanism name"));
            };
            token::export_name(mechanism, &entry.canonical)?
        };
        Ok(self.allocate(exported))
    }

    fn duplicate_name(&self, name: RawHandle) -> Result<RawHandle, ProviderError> {
        let mut state = self.state.lock();
        let entry = state.name(name)?.clone();
        Ok(state.add_name(entry))
    }

    fn release_name(&self, name: RawHandle) -> Result<(), ProviderError> {
        if self.state.lock().names.remove(&name).is_none() {
            return Err(ProviderError::new(MajorStatus::BAD_NAME, 0, "unknown name handle"));
        }
        self.released("name")
    }

    fn inquire_mechs_for_name(&self, name: RawHandle) -> Result<OidSet, ProviderError> {
        let state = self.state.lock();
        match &state.name(name)?.mechanism {
            Some(mechanism) => Ok([mechanism.clone()].into_iter().collect()),
            None => Ok(self.config.mechanisms.clone()),
        }
    }

    fn inquire_names_for_mech(&self, mechanism: &Oid) -> Result<OidSet, ProviderError> {
        self.check_mechanism(mechanism)?;
        Ok([
            GSS_C_NT_USER_NAME,
            GSS_C_NT_STRING_UID_NAME,
            GSS_C_NT_HOSTBASED_SERVICE,
            GSS_C_NT_HOSTBASED_SERVICE_X,
            GSS_C_NT_EXPORT_NAME,
            GSS_KRB5_NT_PRINCIPAL_NAME,
            GSS_KRB5_NT_PRINCIPAL,
        ]
        .into_iter()
        .collect())
    }

    fn indicate_mechs(&self) -> Result<OidSet, ProviderError> {
        Ok(self.config.mechanisms.clone())
    }

    fn get_mic(
        &self,
        context: RawHandle,
        qop: Qop,
        message: &[u8],
    ) -> Result<Box<dyn ProviderAllocation>, ProviderError> {
        check_qop(qop)?;
        let entry = self.open_context(context)?;
        let mut token = qop.0.to_be_bytes().to_vec();
        token.extend_from_slice(&mac(entry.key, qop, message).to_be_bytes());
        Ok(self.allocate(token))
    }

    fn verify_mic(&self, context: RawHandle, message: &[u8], mic: &[u8]) -> Result<Qop, ProviderError> {
        let entry = self.open_context(context)?;
        let mut reader = Reader::new(mic);
        let qop = Qop(reader.u32().map_err(|_| bad_mic())?);
        let tag = reader.u64().map_err(|_| bad_mic())?;
        reader.finish().map_err(|_| bad_mic())?;
        if tag != mac(entry.key, qop, message) {
            return Err(bad_mic());
        }
        Ok(qop)
    }

    fn wrap(
        &self,
        context: RawHandle,
        confidential: bool,
        qop: Qop,
        message: &[u8],
    ) -> Result<RawWrapped, ProviderError> {
        check_qop(qop)?;
        let entry = self.open_context(context)?;
        let confidential = confidential && entry.flags.contains(ContextFlags::CONFIDENTIALITY);
        let mut body = message.to_vec();
        if confidential {
            token::apply_keystream(entry.key, &mut body);
        }
        let mut token = vec![u8::from(confidential)];
        token.extend_from_slice(&qop.0.to_be_bytes());
        token.extend_from_slice(&body);
        token.extend_from_slice(&mac(entry.key, qop, message).to_be_bytes());
        Ok(RawWrapped {
            token: self.allocate(token),
            confidential,
        })
    }

    fn unwrap(&self, context: RawHandle, token: &[u8]) -> Result<RawUnwrapped, ProviderError> {
        let entry = self.open_context(context)?;
        let Some(body_len) = token.len().checked_sub(1 + 4 + 8) else {
            return Err(ProviderError::new(MajorStatus::DEFECTIVE_TOKEN, 0, "wrap token truncated"));
        };
        let mut reader = Reader::new(token);
        let confidential = reader.u8()? != 0;
        let qop = Qop(reader.u32()?);
        let mut message = reader.take(body_len)?.to_vec();
        let tag = reader.u64()?;
        if !reader.rest().is_empty() {
            return Err(ProviderError::new(MajorStatus::DEFECTIVE_TOKEN, 0, "trailing bytes in wrap token"));
        }
        if confidential {
            token::apply_keystream(entry.key, &mut message);
        }
        if tag != mac(entry.key, qop, &message) {
            return Err(bad_mic());
        }
        Ok(RawUnwrapped {
            message: self.allocate(message),
            confidential,
            qop,
        })
    }
}

fn element(
    mechanism: Oid,
    usage: CredentialUsage,
    initiator_lifetime: Lifetime,
    acceptor_lifetime: Lifetime,
) -> Element {
    let expired = Lifetime::Bounded(Duration::ZERO);
    Element {
        mechanism,
        usage,
        initiator_lifetime: if usage.can_initiate() { initiator_lifetime } else { expired },
        acceptor_lifetime: if usage.can_accept() { acceptor_lifetime } else { expired },
    }
}

/// Replaces the channel bindings field of an encoded initiator token.
fn rebind(token: &[u8], bindings: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let Token::Init(mut init) = Token::decode(token)? else {
        return Err(ProviderError::failure("not an initiator token"));
    };
    init.bindings = bindings.to_vec();
    Token::Init(init).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::WorkerPin;

    fn import(provider: &LoopbackProvider, name: &str) -> RawHandle {
        provider.import_name(name.as_bytes(), &GSS_KRB5_NT_PRINCIPAL_NAME).unwrap()
    }

    fn init_args(target: RawHandle, input: Option<&[u8]>) -> InitContextArgs<'_> {
        InitContextArgs {
            credential: None,
            target,
            mechanism: None,
            flags: ContextFlags::MUTUAL_AUTH,
            lifetime: None,
            channel_bindings: None,
            input_token: input,
        }
    }

    #[test]
    fn context_calls_require_a_pinned_worker() {
        let provider = LoopbackProvider::new();
        let target = import(&provider, "HTTP/www.example.com");
        let mut context = None;
        let err = provider.init_sec_context(&mut context, init_args(target, None)).err().unwrap();
        assert_eq!(err.major, MajorStatus::FAILURE);
        assert!(context.is_none());

        let _pin = WorkerPin::acquire();
        let step = provider.init_sec_context(&mut context, init_args(target, None)).unwrap();
        assert!(step.continue_needed);
        step.output_token.unwrap().release().unwrap();
    }

    #[test]
    fn failed_first_step_leaves_a_deletable_handle() {
        let provider = LoopbackProvider::new();
        let _pin = WorkerPin::acquire();
        let mut context = None;
        let missing = RawHandle::new(999).unwrap();
        let err = provider.init_sec_context(&mut context, init_args(missing, None)).err().unwrap();
        assert_eq!(err.major, MajorStatus::BAD_NAME);
        let handle = context.unwrap();
        provider.delete_sec_context(handle).unwrap();
        assert_eq!(provider.delete_sec_context(handle).unwrap_err().major, MajorStatus::NO_CONTEXT);
    }

    #[test]
    fn acceptor_checks_the_target_principal() {
        let provider = LoopbackProvider::new();
        let _pin = WorkerPin::acquire();
        let target = import(&provider, "HTTP/www.example.com");
        let other = import(&provider, "HTTP/db.example.com");
        let credential = provider
            .acquire_credential(Some(other), None, None, CredentialUsage::Accept)
            .unwrap();

        let mut client = None;
        let step = provider.init_sec_context(&mut client, init_args(target, None)).unwrap();
        let token = step.output_token.unwrap();
        let mut server = None;
        let err = provider
            .accept_sec_context(
                &mut server,
                AcceptContextArgs {
                    credential: Some(credential.handle),
                    input_token: token.as_slice(),
                    channel_bindings: None,
                },
            )
            .err().unwrap();
        assert_eq!(err.major, MajorStatus::FAILURE);
        assert!(err.message.contains("HTTP/www.example.com"));
        token.release().unwrap();
        assert_eq!(provider.outstanding_buffers(), 0);
    }

    #[test]
    fn empty_initiator_token_mode() {
        let provider = LoopbackProvider::with_config(LoopbackConfig::default().empty_initiator_token());
        let _pin = WorkerPin::acquire();
        let target = import(&provider, "HTTP/www.example.com");
        let mut context = None;
        let step = provider.init_sec_context(&mut context, init_args(target, None)).unwrap();
        assert!(!step.continue_needed);
        let token = step.output_token.unwrap();
        assert!(token.as_slice().is_empty());
        token.release().unwrap();
    }

    #[test]
    fn hostbased_names_need_a_service() {
        let provider = LoopbackProvider::new();
        let err = provider.import_name(b"@host", &GSS_C_NT_HOSTBASED_SERVICE).unwrap_err();
        assert_eq!(err.major, MajorStatus::BAD_NAME);
        let name = provider.import_name(b"ldap", &GSS_C_NT_HOSTBASED_SERVICE).unwrap();
        let principal = import(&provider, "ldap/localhost");
        assert!(provider.compare_name(name, principal).unwrap());
    }
}
