//! The capability interface between the negotiation core and a security mechanism.
//!
//! A [`SecurityProvider`] follows the shape of the GSS-API C bindings: handles are opaque
//! words, provider memory comes back as [`ProviderAllocation`]s, and every failure carries
//! a major and minor status. The core never looks inside handles or tokens.

use std::{fmt, num::NonZeroU64, sync::Arc};

use crate::{
    buffer::ProviderAllocation,
    channel_bindings::ChannelBindings,
    credentials::CredentialUsage,
    error::ProviderError,
    oid::{Oid, OidSet},
    settings::{ContextFlags, Lifetime, Qop},
};

/// A shared handle to a security provider.
pub type Provider = Arc<dyn SecurityProvider>;

/// An opaque, non-null provider handle for a name, credential or context.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonZeroU64);
impl RawHandle {
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }
    pub fn get(self) -> u64 {
        self.0.get()
    }
    pub fn from_ptr<T>(ptr: *mut T) -> Option<Self> {
        Self::new(ptr as usize as u64)
    }
    pub fn as_ptr<T>(self) -> *mut T {
        self.0.get() as usize as *mut T
    }
}
impl From<NonZeroU64> for RawHandle {
    fn from(value: NonZeroU64) -> Self {
        Self(value)
    }
}
impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

pub struct InitContextArgs<'a> {
    pub credential: Option<RawHandle>,
    pub target: RawHandle,
    pub mechanism: Option<&'a Oid>,
    pub flags: ContextFlags,
    pub lifetime: Option<Lifetime>,
    pub channel_bindings: Option<&'a ChannelBindings>,
    pub input_token: Option<&'a [u8]>,
}

pub struct AcceptContextArgs<'a> {
    pub credential: Option<RawHandle>,
    pub input_token: &'a [u8],
    pub channel_bindings: Option<&'a ChannelBindings>,
}

/// The result of one successful init or accept call.
pub struct ContextStep {
    pub continue_needed: bool,
    pub output_token: Option<Box<dyn ProviderAllocation>>,
    pub mechanism: Option<Oid>,
    pub flags: ContextFlags,
    pub lifetime: Lifetime,
    /// Acceptor only: the authenticated initiator.
    pub source: Option<RawHandle>,
    /// Acceptor only: a credential the initiator delegated.
    pub delegated: Option<RawHandle>,
}

pub struct AcquiredCredential {
    pub handle: RawHandle,
    pub mechanisms: OidSet,
    pub lifetime: Lifetime,
}

pub struct AddedCredential {
    pub handle: RawHandle,
    pub mechanisms: OidSet,
    pub initiator_lifetime: Lifetime,
    pub acceptor_lifetime: Lifetime,
}

pub struct RawCredentialInfo {
    pub name: Option<RawHandle>,
    pub lifetime: Lifetime,
    pub usage: CredentialUsage,
    pub mechanisms: OidSet,
}

pub struct RawMechanismCredentialInfo {
    pub name: Option<RawHandle>,
    pub initiator_lifetime: Lifetime,
    pub acceptor_lifetime: Lifetime,
    pub usage: CredentialUsage,
}

pub struct RawContextInfo {
    pub source: Option<RawHandle>,
    pub target: Option<RawHandle>,
    pub lifetime: Lifetime,
    pub mechanism: Option<Oid>,
    pub flags: ContextFlags,
    pub locally_initiated: bool,
    pub open: bool,
}

pub struct RawWrapped {
    pub token: Box<dyn ProviderAllocation>,
    pub confidential: bool,
}

pub struct RawUnwrapped {
    pub message: Box<dyn ProviderAllocation>,
    pub confidential: bool,
    pub qop: Qop,
}

pub struct RawDisplayName {
    pub text: String,
    pub name_type: Option<Oid>,
}

/// A security mechanism library.
///
/// Context calls (`init_sec_context`, `accept_sec_context`, `delete_sec_context`) are only
/// made from a thread holding a [`crate::pin::WorkerPin`]. `context` is updated in place:
/// a provider may create the handle on the first call and must leave it set even when the
/// call fails, so the caller can delete it.
pub trait SecurityProvider: Send + Sync + fmt::Debug {
    fn acquire_credential(
        &self,
        name: Option<RawHandle>,
        lifetime: Option<Lifetime>,
        mechanisms: Option<&OidSet>,
        usage: CredentialUsage,
    ) -> Result<AcquiredCredential, ProviderError>;
    fn add_credential(
        &self,
        credential: RawHandle,
        name: Option<RawHandle>,
        mechanism: &Oid,
        usage: CredentialUsage,
        initiator_lifetime: Option<Lifetime>,
        acceptor_lifetime: Option<Lifetime>,
    ) -> Result<AddedCredential, ProviderError>;
    fn inquire_credential(&self, credential: RawHandle) -> Result<RawCredentialInfo, ProviderError>;
    fn inquire_credential_by_mech(
        &self,
        credential: RawHandle,
        mechanism: &Oid,
    ) -> Result<RawMechanismCredentialInfo, ProviderError>;
    fn release_credential(&self, credential: RawHandle) -> Result<(), ProviderError>;

    fn init_sec_context(
        &self,
        context: &mut Option<RawHandle>,
        args: InitContextArgs<'_>,
    ) -> Result<ContextStep, ProviderError>;
    fn accept_sec_context(
        &self,
        context: &mut Option<RawHandle>,
        args: AcceptContextArgs<'_>,
    ) -> Result<ContextStep, ProviderError>;
    fn delete_sec_context(&self, context: RawHandle) -> Result<(), ProviderError>;
    fn inquire_context(&self, context: RawHandle) -> Result<RawContextInfo, ProviderError>;

    fn import_name(&self, name: &[u8], name_type: &Oid) -> Result<RawHandle, ProviderError>;
    fn canonicalize_name(&self, name: RawHandle, mechanism: &Oid) -> Result<RawHandle, ProviderError>;
    fn compare_name(&self, first: RawHandle, second: RawHandle) -> Result<bool, ProviderError>;
    fn display_name(&self, name: RawHandle) -> Result<RawDisplayName, ProviderError>;
    fn export_name(&self, name: RawHandle) -> Result<Box<dyn ProviderAllocation>, ProviderError>;
    fn duplicate_name(&self, name: RawHandle) -> Result<RawHandle, ProviderError>;
    fn release_name(&self, name: RawHandle) -> Result<(), ProviderError>;
    fn inquire_mechs_for_name(&self, name: RawHandle) -> Result<OidSet, ProviderError>;
    fn inquire_names_for_mech(&self, mechanism: &Oid) -> Result<OidSet, ProviderError>;
    fn indicate_mechs(&self) -> Result<OidSet, ProviderError>;

    fn get_mic(
        &self,
        context: RawHandle,
        qop: Qop,
        message: &[u8],
    ) -> Result<Box<dyn ProviderAllocation>, ProviderError>;
    fn verify_mic(&self, context: RawHandle, message: &[u8], mic: &[u8]) -> Result<Qop, ProviderError>;
    fn wrap(&self, context: RawHandle, confidential: bool, qop: Qop, message: &[u8])
        -> Result<RawWrapped, ProviderError>;
    fn unwrap(&self, context: RawHandle, token: &[u8]) -> Result<RawUnwrapped, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_handles_round_trip_pointers() {
        let mut slot = 0u8;
        let ptr = std::ptr::from_mut(&mut slot);
        let handle = RawHandle::from_ptr(ptr).unwrap();
        assert_eq!(handle.as_ptr::<u8>(), ptr);
        assert!(RawHandle::from_ptr(std::ptr::null_mut::<u8>()).is_none());
        assert!(RawHandle::new(0).is_none());
    }
}
