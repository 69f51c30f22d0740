use tracing::warn;

use crate::{
    buffer::TokenBuffer,
    channel_bindings::ChannelBindings,
    context::{Accepted, InitiateRequest, Initiated, SecurityContext},
    credentials::Credential,
    provider::Provider,
    step::StepOut,
    Error,
};

pub const DEFAULT_MAX_ROUNDS: usize = 8;

/// A security context that gives up after a fixed number of rounds.
///
/// Handshakes have no timeout of their own. When the bound is hit the context is deleted
/// and the step fails with [`Error::TooManyRounds`].
#[derive(Debug)]
pub struct Handshake {
    context: SecurityContext,
    max_rounds: usize,
    rounds: usize,
}
impl Handshake {
    pub fn new(context: SecurityContext, max_rounds: usize) -> Self {
        Self {
            context,
            max_rounds,
            rounds: 0,
        }
    }
    pub fn initiator(provider: &Provider) -> Self {
        Self::new(SecurityContext::initiator(provider), DEFAULT_MAX_ROUNDS)
    }
    pub fn acceptor(provider: &Provider) -> Self {
        Self::new(SecurityContext::acceptor(provider), DEFAULT_MAX_ROUNDS)
    }
    pub fn initiate(&mut self, request: &InitiateRequest<'_>, input: Option<&TokenBuffer>) -> StepOut<Initiated> {
        if let Err(err) = self.begin_round() {
            return StepOut::Failed(err);
        }
        self.context.initiate(request, input)
    }
    pub fn accept(
        &mut self,
        credential: Option<&Credential>,
        input: &TokenBuffer,
        channel_bindings: Option<&ChannelBindings>,
    ) -> StepOut<Accepted> {
        if let Err(err) = self.begin_round() {
            return StepOut::Failed(err);
        }
        self.context.accept(credential, input, channel_bindings)
    }
    fn begin_round(&mut self) -> Result<(), Error> {
        if self.rounds >= self.max_rounds {
            if let Err(err) = self.context.delete() {
                warn!(%err, "failed to delete abandoned security context");
            }
            return Err(Error::TooManyRounds(self.max_rounds));
        }
        self.rounds += 1;
        Ok(())
    }
    pub fn rounds(&self) -> usize {
        self.rounds
    }
    pub fn context(&self) -> &SecurityContext {
        &self.context
    }
    pub fn into_context(self) -> SecurityContext {
        self.context
    }
}
