use std::{fmt, time::Duration};

use bitflags::bitflags;

bitflags! {
    /// Context services as numbered by RFC 2744.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ContextFlags: u32 {
        const DELEGATION = 1;
        const MUTUAL_AUTH = 2;
        const REPLAY_DETECTION = 4;
        const SEQUENCING = 8;
        const CONFIDENTIALITY = 16;
        const INTEGRITY = 32;
        const ANONYMITY = 64;
        const PROTECTION_READY = 128;
        const TRANSFERABLE = 256;
        const DELEGATION_POLICY = 32768;
    }
}

/// Quality of protection. `0` is the mechanism default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qop(pub u32);
impl Qop {
    pub const DEFAULT: Self = Self(0);
}
impl fmt::Display for Qop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qop {}", self.0)
    }
}

/// Validity of a credential or context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifetime {
    Indefinite,
    Bounded(Duration),
}
impl Lifetime {
    const INDEFINITE_SECS: u32 = u32::MAX;

    /// Interprets a GSS-API time value, where all bits set means indefinite.
    pub fn from_secs(secs: u32) -> Self {
        match secs {
            Self::INDEFINITE_SECS => Self::Indefinite,
            secs => Self::Bounded(Duration::from_secs(secs.into())),
        }
    }
    /// The GSS-API time value, saturating just below the indefinite marker.
    pub fn as_secs(self) -> u32 {
        match self {
            Self::Indefinite => Self::INDEFINITE_SECS,
            Self::Bounded(duration) => duration
                .as_secs()
                .try_into()
                .unwrap_or(Self::INDEFINITE_SECS - 1)
                .min(Self::INDEFINITE_SECS - 1),
        }
    }
    pub fn is_expired(self) -> bool {
        self == Self::Bounded(Duration::ZERO)
    }
}
impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indefinite => f.write_str("indefinite"),
            Self::Bounded(duration) => write!(f, "{}s", duration.as_secs()),
        }
    }
}

/// Maps a requested lifetime to a GSS-API time value, `0` asking for the default.
pub(crate) fn requested_secs(lifetime: Option<Lifetime>) -> u32 {
    lifetime.map(Lifetime::as_secs).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_values_follow_rfc_2744() {
        assert_eq!(ContextFlags::MUTUAL_AUTH.bits(), 2);
        assert_eq!(ContextFlags::INTEGRITY.bits(), 32);
        assert_eq!(ContextFlags::DELEGATION_POLICY.bits(), 0x8000);
        let flags = ContextFlags::from_bits_truncate(0x8000 | 16 | 1 << 20);
        assert_eq!(flags, ContextFlags::DELEGATION_POLICY | ContextFlags::CONFIDENTIALITY);
    }

    #[test]
    fn lifetime_saturates_below_indefinite() {
        assert_eq!(Lifetime::from_secs(u32::MAX), Lifetime::Indefinite);
        assert_eq!(Lifetime::from_secs(60), Lifetime::Bounded(Duration::from_secs(60)));
        assert_eq!(Lifetime::Bounded(Duration::from_secs(u64::MAX)).as_secs(), u32::MAX - 1);
        assert_eq!(requested_secs(None), 0);
        assert_eq!(requested_secs(Some(Lifetime::Indefinite)), u32::MAX);
        assert!(Lifetime::from_secs(0).is_expired());
    }
}
