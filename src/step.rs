use crate::{buffer::TokenBuffer, Error};

/// The outcome of one initiate or accept call.
///
/// Needing another round trip is not a failure: `Continue` carries the token to send to
/// the peer, whose reply goes into the next call on the same context.
#[must_use]
#[derive(Debug)]
pub enum StepOut<T> {
    Finished(T),
    Continue(TokenBuffer),
    Failed(Error),
}
impl<T> StepOut<T> {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue(_))
    }
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepOut<U> {
        match self {
            Self::Finished(done) => StepOut::Finished(f(done)),
            Self::Continue(token) => StepOut::Continue(token),
            Self::Failed(err) => StepOut::Failed(err),
        }
    }
    /// Splits off the failure so that `?` can be used on the remaining two outcomes.
    pub fn into_result(self) -> Result<Progress<T>, Error> {
        match self {
            Self::Finished(done) => Ok(Progress::Finished(done)),
            Self::Continue(token) => Ok(Progress::Continue(token)),
            Self::Failed(err) => Err(err),
        }
    }
}

#[derive(Debug)]
pub enum Progress<T> {
    Finished(T),
    Continue(TokenBuffer),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_is_not_an_error() {
        let step: StepOut<()> = StepOut::Continue(TokenBuffer::from_bytes(b"next"));
        assert!(step.is_continue());
        match step.into_result() {
            Ok(Progress::Continue(token)) => assert_eq!(token.as_bytes(), b"next"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn failure_surfaces_through_into_result() {
        let step: StepOut<u8> = StepOut::Failed(Error::Released);
        assert!(step.is_failed());
        assert!(matches!(step.map(|v| v + 1).into_result(), Err(Error::Released)));
        assert!(StepOut::<u8>::Finished(1).map(|v| v + 1).is_finished());
    }
}
