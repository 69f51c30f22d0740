use std::fmt;

use tracing::warn;

use crate::{
    buffer::TokenBuffer,
    oid::{Oid, OidSet},
    provider::{Provider, RawHandle},
    Error,
};

/// A principal name held by a security provider.
pub struct Principal {
    provider: Provider,
    handle: Option<RawHandle>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayName {
    pub text: String,
    pub name_type: Option<Oid>,
}

impl Principal {
    pub(crate) fn from_raw(provider: &Provider, handle: RawHandle) -> Self {
        Self {
            provider: provider.clone(),
            handle: Some(handle),
        }
    }
    pub(crate) fn raw(&self) -> Result<RawHandle, Error> {
        self.handle.ok_or(Error::Released)
    }
    /// Imports a printable or exported name of type `name_type`.
    pub fn import(provider: &Provider, buffer: &TokenBuffer, name_type: &Oid) -> Result<Self, Error> {
        let handle = provider
            .import_name(buffer.as_bytes(), name_type)
            .map_err(Error::Import)?;
        Ok(Self::from_raw(provider, handle))
    }
    pub fn parse(provider: &Provider, name: &str, name_type: &Oid) -> Result<Self, Error> {
        Self::import(provider, &TokenBuffer::from_text(name), name_type)
    }
    /// Reduces the name to a mechanism name for `mechanism`.
    pub fn canonicalize(&self, mechanism: &Oid) -> Result<Self, Error> {
        let handle = self.provider.canonicalize_name(self.raw()?, mechanism)?;
        Ok(Self::from_raw(&self.provider, handle))
    }
    pub fn duplicate(&self) -> Result<Self, Error> {
        let handle = self.provider.duplicate_name(self.raw()?)?;
        Ok(Self::from_raw(&self.provider, handle))
    }
    /// The exported name token. It stays valid after this principal is released.
    pub fn export(&self) -> Result<TokenBuffer, Error> {
        let allocation = self.provider.export_name(self.raw()?)?;
        Ok(TokenBuffer::from_provider(allocation))
    }
    pub fn display(&self) -> Result<DisplayName, Error> {
        let raw = self.provider.display_name(self.raw()?)?;
        Ok(DisplayName {
            text: raw.text,
            name_type: raw.name_type,
        })
    }
    /// Asks the provider whether both names denote the same principal. A released or
    /// invalid name is an error, never a mismatch.
    pub fn equals(&self, other: &Principal) -> Result<bool, Error> {
        Ok(self.provider.compare_name(self.raw()?, other.raw()?)?)
    }
    pub fn inquire_mechanisms(&self) -> Result<OidSet, Error> {
        Ok(self.provider.inquire_mechs_for_name(self.raw()?)?)
    }
    pub fn provider(&self) -> &Provider {
        &self.provider
    }
    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }
    /// Releases the provider handle. Further calls are no-ops, and the handle is gone even
    /// when the provider reports a failure.
    pub fn release(&mut self) -> Result<(), Error> {
        match self.handle.take() {
            Some(handle) => Ok(self.provider.release_name(handle)?),
            None => Ok(()),
        }
    }
}
impl Drop for Principal {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(%err, "failed to release name");
        }
    }
}
/// Prints the provider's display form, or nothing if the provider cannot display it.
impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.display() {
            Ok(name) => f.write_str(&name.text),
            Err(_) => Ok(()),
        }
    }
}
impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal").field("handle", &self.handle).finish()
    }
}

/// Mechanisms the provider supports.
pub fn indicate_mechanisms(provider: &Provider) -> Result<OidSet, Error> {
    Ok(provider.indicate_mechs()?)
}

/// Name types `mechanism` can import.
pub fn names_for_mechanism(provider: &Provider, mechanism: &Oid) -> Result<OidSet, Error> {
    Ok(provider.inquire_names_for_mech(mechanism)?)
}
