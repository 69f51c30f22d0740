use std::{cell::Cell, fmt, marker::PhantomData};

use tracing::{debug, warn};

use crate::{
    name::Principal,
    oid::{Oid, OidSet},
    provider::{Provider, RawHandle},
    settings::Lifetime,
    Error,
};

/// What a credential may be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CredentialUsage {
    Initiate,
    Accept,
    Both,
}
impl CredentialUsage {
    pub fn can_initiate(self) -> bool {
        matches!(self, Self::Initiate | Self::Both)
    }
    pub fn can_accept(self) -> bool {
        matches!(self, Self::Accept | Self::Both)
    }
}

/// A credential handle held by a security provider.
///
/// The handle may move between threads but is not shared between them; wrap it in a mutex
/// to use it from several.
pub struct Credential {
    provider: Provider,
    handle: Option<RawHandle>,
    usage: CredentialUsage,
    _not_sync: PhantomData<Cell<()>>,
}

#[derive(Debug)]
pub struct Acquired {
    pub credential: Credential,
    pub mechanisms: OidSet,
    pub lifetime: Lifetime,
}

#[derive(Debug)]
pub struct Augmented {
    pub credential: Credential,
    pub mechanisms: OidSet,
    pub initiator_lifetime: Lifetime,
    pub acceptor_lifetime: Lifetime,
}

#[derive(Debug)]
pub struct CredentialInfo {
    pub principal: Option<Principal>,
    pub lifetime: Lifetime,
    pub usage: CredentialUsage,
    pub mechanisms: OidSet,
}

#[derive(Debug)]
pub struct MechanismCredentialInfo {
    pub principal: Option<Principal>,
    pub initiator_lifetime: Lifetime,
    pub acceptor_lifetime: Lifetime,
    pub usage: CredentialUsage,
}

impl Credential {
    pub(crate) fn from_raw(provider: &Provider, handle: RawHandle, usage: CredentialUsage) -> Self {
        Self {
            provider: provider.clone(),
            handle: Some(handle),
            usage,
            _not_sync: PhantomData,
        }
    }
    pub(crate) fn raw(&self) -> Result<RawHandle, Error> {
        self.handle.ok_or(Error::Released)
    }
    /// Acquires a credential for `principal`, or for the provider's default principal.
    ///
    /// `lifetime` of `None` asks for the provider default, and `desired` of `None` for its
    /// default mechanisms.
    pub fn acquire(
        provider: &Provider,
        principal: Option<&Principal>,
        lifetime: Option<Lifetime>,
        desired: Option<&OidSet>,
        usage: CredentialUsage,
    ) -> Result<Acquired, Error> {
        let name = principal.map(Principal::raw).transpose()?;
        let acquired = provider
            .acquire_credential(name, lifetime, desired, usage)
            .map_err(Error::Acquire)?;
        debug!(?usage, mechanisms = %acquired.mechanisms, lifetime = %acquired.lifetime, "acquired credential");
        Ok(Acquired {
            credential: Self::from_raw(provider, acquired.handle, usage),
            mechanisms: acquired.mechanisms,
            lifetime: acquired.lifetime,
        })
    }
    pub fn inbound(provider: &Provider, principal: Option<&Principal>) -> Result<Self, Error> {
        Ok(Self::acquire(provider, principal, None, None, CredentialUsage::Accept)?.credential)
    }
    pub fn outbound(provider: &Provider, principal: Option<&Principal>) -> Result<Self, Error> {
        Ok(Self::acquire(provider, principal, None, None, CredentialUsage::Initiate)?.credential)
    }
    pub fn both(provider: &Provider, principal: Option<&Principal>) -> Result<Self, Error> {
        Ok(Self::acquire(provider, principal, None, None, CredentialUsage::Both)?.credential)
    }
    /// Creates a new credential holding this one's elements plus one for `mechanism`.
    /// This credential is left unchanged.
    pub fn augment(
        &self,
        principal: Option<&Principal>,
        mechanism: &Oid,
        usage: CredentialUsage,
        initiator_lifetime: Option<Lifetime>,
        acceptor_lifetime: Option<Lifetime>,
    ) -> Result<Augmented, Error> {
        let name = principal.map(Principal::raw).transpose()?;
        let added = self.provider.add_credential(
            self.raw()?,
            name,
            mechanism,
            usage,
            initiator_lifetime,
            acceptor_lifetime,
        )?;
        let combined = if usage == self.usage { usage } else { CredentialUsage::Both };
        Ok(Augmented {
            credential: Self::from_raw(&self.provider, added.handle, combined),
            mechanisms: added.mechanisms,
            initiator_lifetime: added.initiator_lifetime,
            acceptor_lifetime: added.acceptor_lifetime,
        })
    }
    pub fn inquire(&self) -> Result<CredentialInfo, Error> {
        let info = self.provider.inquire_credential(self.raw()?)?;
        Ok(CredentialInfo {
            principal: info.name.map(|name| Principal::from_raw(&self.provider, name)),
            lifetime: info.lifetime,
            usage: info.usage,
            mechanisms: info.mechanisms,
        })
    }
    pub fn inquire_by_mechanism(&self, mechanism: &Oid) -> Result<MechanismCredentialInfo, Error> {
        let info = self.provider.inquire_credential_by_mech(self.raw()?, mechanism)?;
        Ok(MechanismCredentialInfo {
            principal: info.name.map(|name| Principal::from_raw(&self.provider, name)),
            initiator_lifetime: info.initiator_lifetime,
            acceptor_lifetime: info.acceptor_lifetime,
            usage: info.usage,
        })
    }
    pub fn usage(&self) -> CredentialUsage {
        self.usage
    }
    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }
    /// Releases the provider handle. The handle is gone afterwards even if the provider
    /// reports a failure, and releasing again does nothing.
    pub fn release(&mut self) -> Result<(), Error> {
        match self.handle.take() {
            Some(handle) => Ok(self.provider.release_credential(handle)?),
            None => Ok(()),
        }
    }
}
impl Drop for Credential {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(%err, "failed to release credential");
        }
    }
}
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("handle", &self.handle)
            .field("usage", &self.usage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        error::MajorStatus,
        loopback::{LoopbackConfig, LoopbackProvider, LOOPBACK_MECH},
        oid::{GSS_KRB5_NT_PRINCIPAL_NAME, GSS_MECH_KRB5, GSS_MECH_SPNEGO},
    };

    fn provider(config: LoopbackConfig) -> (Arc<LoopbackProvider>, Provider) {
        let loopback = Arc::new(LoopbackProvider::with_config(config));
        let provider: Provider = loopback.clone();
        (loopback, provider)
    }

    #[test]
    fn acquire_reports_mechanisms_and_lifetime() {
        let (_, provider) = provider(LoopbackConfig::default());
        let name = Principal::parse(&provider, "alice@EXAMPLE.COM", &GSS_KRB5_NT_PRINCIPAL_NAME).unwrap();
        let lifetime = Lifetime::Bounded(Duration::from_secs(600));
        let acquired =
            Credential::acquire(&provider, Some(&name), Some(lifetime), None, CredentialUsage::Initiate).unwrap();
        assert_eq!(acquired.lifetime, lifetime);
        assert!(acquired.mechanisms.contains(&LOOPBACK_MECH));
        assert_eq!(acquired.credential.usage(), CredentialUsage::Initiate);

        let info = acquired.credential.inquire().unwrap();
        assert_eq!(info.principal.unwrap().to_string(), "alice@EXAMPLE.COM");
        assert_eq!(info.usage, CredentialUsage::Initiate);
    }

    #[test]
    fn acquire_without_key_material_fails() {
        let (_, provider) = provider(LoopbackConfig::default().with_acceptors(["HTTP/www.example.com"]));
        let name = Principal::parse(&provider, "HTTP/db.example.com", &GSS_KRB5_NT_PRINCIPAL_NAME).unwrap();
        let err = Credential::inbound(&provider, Some(&name)).unwrap_err();
        assert!(matches!(err, Error::Acquire(ref e) if e.major == MajorStatus::NO_CRED));
        assert!(Credential::outbound(&provider, Some(&name)).is_ok());
    }

    #[test]
    fn acquire_with_unsupported_mechanism_fails() {
        let (_, provider) = provider(LoopbackConfig::default());
        let desired: OidSet = [GSS_MECH_KRB5].into_iter().collect();
        let err = Credential::acquire(&provider, None, None, Some(&desired), CredentialUsage::Both).unwrap_err();
        assert!(matches!(err, Error::Acquire(ref e) if e.major == MajorStatus::BAD_MECH));
    }

    #[test]
    fn augment_keeps_existing_mechanisms() {
        let (_, provider) = provider(LoopbackConfig::default().with_mechanism(GSS_MECH_SPNEGO));
        let desired: OidSet = [LOOPBACK_MECH].into_iter().collect();
        let acquired =
            Credential::acquire(&provider, None, None, Some(&desired), CredentialUsage::Initiate).unwrap();
        assert_eq!(acquired.mechanisms.len(), 1);

        let augmented = acquired
            .credential
            .augment(None, &GSS_MECH_SPNEGO, CredentialUsage::Accept, None, None)
            .unwrap();
        assert!(augmented.mechanisms.contains(&LOOPBACK_MECH));
        assert!(augmented.mechanisms.contains(&GSS_MECH_SPNEGO));
        assert_eq!(augmented.credential.usage(), CredentialUsage::Both);
        assert_eq!(acquired.credential.inquire().unwrap().mechanisms.len(), 1);

        let by_mech = augmented.credential.inquire_by_mechanism(&GSS_MECH_SPNEGO).unwrap();
        assert_eq!(by_mech.usage, CredentialUsage::Accept);
        assert!(!by_mech.acceptor_lifetime.is_expired());
    }

    #[test]
    fn failed_release_still_drops_the_handle() {
        let (loopback, provider) = provider(LoopbackConfig::default().failing_releases());
        let mut credential = Credential::both(&provider, None).unwrap();
        assert!(credential.release().is_err());
        assert!(credential.is_released());
        credential.release().unwrap();
        assert!(matches!(credential.inquire(), Err(Error::Released)));
        assert_eq!(loopback.live_handles(), 0);
    }
}
