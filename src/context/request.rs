use std::time::Duration;

use crate::{
    channel_bindings::{Channel, ChannelBindings},
    credentials::Credential,
    name::Principal,
    oid::Oid,
    settings::{ContextFlags, Lifetime},
};

/// Parameters of an initiator step. The same request is passed on every round of one
/// handshake.
#[derive(Clone, Debug)]
pub struct InitiateRequest<'a> {
    pub(crate) target: &'a Principal,
    pub(crate) credential: Option<&'a Credential>,
    pub(crate) mechanism: Option<Oid>,
    pub(crate) flags: ContextFlags,
    pub(crate) lifetime: Option<Lifetime>,
    pub(crate) channel_bindings: Option<ChannelBindings>,
}
impl<'a> InitiateRequest<'a> {
    /// A request for `target` with the default credential, the default mechanism and no
    /// services.
    pub fn new(target: &'a Principal) -> Self {
        Self {
            target,
            credential: None,
            mechanism: None,
            flags: ContextFlags::empty(),
            lifetime: None,
            channel_bindings: None,
        }
    }
    #[must_use]
    pub fn with_credential(self, credential: &'a Credential) -> Self {
        Self {
            credential: Some(credential),
            ..self
        }
    }
    #[must_use]
    pub fn with_mechanism(self, mechanism: Oid) -> Self {
        Self {
            mechanism: Some(mechanism),
            ..self
        }
    }
    #[must_use]
    pub fn with_flags(self, flags: ContextFlags) -> Self {
        Self {
            flags: self.flags | flags,
            ..self
        }
    }
    #[must_use]
    pub fn request_mutual_auth(self) -> Self {
        self.with_flags(ContextFlags::MUTUAL_AUTH)
    }
    #[must_use]
    pub fn request_signing(self) -> Self {
        self.with_flags(ContextFlags::INTEGRITY)
    }
    #[must_use]
    pub fn request_encryption(self) -> Self {
        self.with_flags(ContextFlags::CONFIDENTIALITY)
    }
    /// Asks the initiator's credential to be forwarded to the acceptor.
    ///
    /// Only works for mechanisms that support delegation, such as Kerberos.
    #[must_use]
    pub fn request_delegation(self) -> Self {
        self.with_flags(ContextFlags::DELEGATION)
    }
    #[must_use]
    pub fn request_replay_detection(self) -> Self {
        self.with_flags(ContextFlags::REPLAY_DETECTION)
    }
    #[must_use]
    pub fn request_sequencing(self) -> Self {
        self.with_flags(ContextFlags::SEQUENCING)
    }
    #[must_use]
    pub fn request_duration(self, duration: Duration) -> Self {
        Self {
            lifetime: Some(Lifetime::Bounded(duration)),
            ..self
        }
    }
    #[must_use]
    pub fn with_channel_bindings(self, bindings: ChannelBindings) -> Self {
        Self {
            channel_bindings: Some(bindings),
            ..self
        }
    }
    pub fn bind_to_channel<C: Channel>(self, channel: &C) -> Result<Self, C::Error> {
        let channel_bindings = ChannelBindings::from_channel(channel)?;
        Ok(Self {
            channel_bindings,
            ..self
        })
    }
    pub fn flags(&self) -> ContextFlags {
        self.flags
    }
}
