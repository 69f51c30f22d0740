use http::HeaderName;
use thiserror::Error;

use crate::Error;

#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("request has no {0} header")]
    MissingHeader(HeaderName),
    #[error("authentication scheme is not Negotiate")]
    WrongScheme,
    #[error("Negotiate token is not valid base64")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("Negotiate header carries no token")]
    EmptyPayload,
    #[error("security context unexpectedly needs another round trip")]
    UnexpectedContinuation,
    #[error("security provider produced an empty Negotiate token")]
    EmptyToken,
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    #[error("a {0} session cannot {1}")]
    Role(&'static str, &'static str),
    #[error(transparent)]
    Gss(#[from] Error),
}
impl NegotiateError {
    /// Whether the peer never attempted Negotiate authentication, as opposed to attempting it badly.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::MissingHeader(_) | Self::WrongScheme)
    }
}
