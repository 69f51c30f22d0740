use std::fmt::{self, Display};

use thiserror::Error;

use crate::{context::ContextState, settings::Qop};

/// Errors surfaced by names, credentials and security contexts.
#[derive(Debug, Error)]
pub enum Error {
    /// A buffer could not be allocated.
    #[error("could not allocate {0} bytes")]
    Allocation(usize),

    /// The provider rejected a name as malformed or of an unsupported type.
    #[error("could not import name: {0}")]
    Import(#[source] ProviderError),

    /// The provider could not produce a credential.
    #[error("could not acquire credentials: {0}")]
    Acquire(#[source] ProviderError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("index {index} is out of range for a set of {len}")]
    Index { index: usize, len: usize },

    #[error("cannot {operation} a security context that is {state}")]
    InvalidState {
        state: ContextState,
        operation: &'static str,
    },

    /// The handle was already released.
    #[error("the handle has already been released")]
    Released,

    #[error("quality of protection {actual} is below the required {required}")]
    InsufficientQop { required: Qop, actual: Qop },

    #[error("handshake did not complete within {0} rounds")]
    TooManyRounds(usize),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A failure reported by a security provider.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message} ({major}, minor status {minor})")]
pub struct ProviderError {
    pub major: MajorStatus,
    pub minor: u32,
    pub message: String,
}
impl ProviderError {
    pub fn new(major: MajorStatus, minor: u32, message: impl Into<String>) -> Self {
        Self {
            major,
            minor,
            message: message.into(),
        }
    }
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(MajorStatus::FAILURE, 0, message)
    }
    /// The routine error carried by the major status, stripped of calling errors and
    /// supplementary bits.
    pub fn routine_error(&self) -> MajorStatus {
        self.major.routine_error()
    }
}

/// A GSS-API major status word as laid out by RFC 2744.
///
/// Bits 24..32 carry calling errors, bits 16..24 routine errors and the low 16 bits
/// supplementary information such as [`MajorStatus::CONTINUE_NEEDED`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MajorStatus(pub u32);
impl MajorStatus {
    pub const COMPLETE: Self = Self(0);

    pub const CALL_INACCESSIBLE_READ: Self = Self::calling(1);
    pub const CALL_INACCESSIBLE_WRITE: Self = Self::calling(2);
    pub const CALL_BAD_STRUCTURE: Self = Self::calling(3);

    pub const BAD_MECH: Self = Self::routine(1);
    pub const BAD_NAME: Self = Self::routine(2);
    pub const BAD_NAMETYPE: Self = Self::routine(3);
    pub const BAD_BINDINGS: Self = Self::routine(4);
    pub const BAD_STATUS: Self = Self::routine(5);
    pub const BAD_MIC: Self = Self::routine(6);
    pub const NO_CRED: Self = Self::routine(7);
    pub const NO_CONTEXT: Self = Self::routine(8);
    pub const DEFECTIVE_TOKEN: Self = Self::routine(9);
    pub const DEFECTIVE_CREDENTIAL: Self = Self::routine(10);
    pub const CREDENTIALS_EXPIRED: Self = Self::routine(11);
    pub const CONTEXT_EXPIRED: Self = Self::routine(12);
    pub const FAILURE: Self = Self::routine(13);
    pub const BAD_QOP: Self = Self::routine(14);
    pub const UNAUTHORIZED: Self = Self::routine(15);
    pub const UNAVAILABLE: Self = Self::routine(16);
    pub const DUPLICATE_ELEMENT: Self = Self::routine(17);
    pub const NAME_NOT_MN: Self = Self::routine(18);

    pub const CONTINUE_NEEDED: Self = Self(1);
    pub const DUPLICATE_TOKEN: Self = Self(1 << 1);
    pub const OLD_TOKEN: Self = Self(1 << 2);
    pub const UNSEQ_TOKEN: Self = Self(1 << 3);
    pub const GAP_TOKEN: Self = Self(1 << 4);

    const fn calling(code: u32) -> Self {
        Self(code << 24)
    }
    const fn routine(code: u32) -> Self {
        Self(code << 16)
    }
    /// True if a calling or routine error is set.
    pub const fn is_error(self) -> bool {
        self.0 & 0xFFFF_0000 != 0
    }
    pub const fn continue_needed(self) -> bool {
        self.0 & Self::CONTINUE_NEEDED.0 != 0
    }
    pub const fn routine_error(self) -> Self {
        Self(self.0 & 0x00FF_0000)
    }
    pub const fn calling_error(self) -> Self {
        Self(self.0 & 0xFF00_0000)
    }
    fn routine_name(self) -> Option<&'static str> {
        let name = match self.routine_error() {
            Self::BAD_MECH => "unsupported mechanism",
            Self::BAD_NAME => "invalid name",
            Self::BAD_NAMETYPE => "unsupported name type",
            Self::BAD_BINDINGS => "channel binding mismatch",
            Self::BAD_STATUS => "invalid status code",
            Self::BAD_MIC => "message integrity check failed",
            Self::NO_CRED => "no credentials available",
            Self::NO_CONTEXT => "no security context",
            Self::DEFECTIVE_TOKEN => "defective token",
            Self::DEFECTIVE_CREDENTIAL => "defective credential",
            Self::CREDENTIALS_EXPIRED => "credentials expired",
            Self::CONTEXT_EXPIRED => "context expired",
            Self::FAILURE => "unspecified failure",
            Self::BAD_QOP => "unsupported quality of protection",
            Self::UNAUTHORIZED => "operation not authorized",
            Self::UNAVAILABLE => "operation unavailable",
            Self::DUPLICATE_ELEMENT => "duplicate credential element",
            Self::NAME_NOT_MN => "name is not a mechanism name",
            _ => return None,
        };
        Some(name)
    }
}
impl Display for MajorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.routine_name() {
            Some(name) => write!(f, "{name} [{:#010x}]", self.0),
            None if self.calling_error().0 != 0 => write!(f, "calling error [{:#010x}]", self.0),
            None => write!(f, "major status {:#010x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routine_errors_are_errors() {
        assert!(MajorStatus::BAD_NAME.is_error());
        assert!(MajorStatus::CALL_BAD_STRUCTURE.is_error());
        assert!(!MajorStatus::COMPLETE.is_error());
        assert!(!MajorStatus::CONTINUE_NEEDED.is_error());
        assert!(!MajorStatus(MajorStatus::CONTINUE_NEEDED.0 | MajorStatus::GAP_TOKEN.0).is_error());
    }

    #[test]
    fn routine_error_strips_supplementary_bits() {
        let status = MajorStatus(MajorStatus::DEFECTIVE_TOKEN.0 | MajorStatus::OLD_TOKEN.0);
        assert_eq!(status.routine_error(), MajorStatus::DEFECTIVE_TOKEN);
        assert_eq!(
            ProviderError::new(status, 7, "bad token").routine_error(),
            MajorStatus::DEFECTIVE_TOKEN
        );
    }

    #[test]
    fn display_names_the_routine_error() {
        let err = ProviderError::new(MajorStatus::NO_CRED, 3, "keytab is empty");
        let text = err.to_string();
        assert!(text.starts_with("keytab is empty"));
        assert!(text.contains("no credentials available"));
        assert!(text.contains("minor status 3"));
    }
}
