use std::ops::Deref;

use crate::{buffer::TokenBuffer, context::SecurityContext, settings::Qop, Error};

impl SecurityContext {
    /// A detached integrity token over `message`.
    pub fn get_mic(&self, message: &[u8]) -> Result<TokenBuffer, Error> {
        self.get_mic_with_qop(Qop::DEFAULT, message)
    }
    pub fn get_mic_with_qop(&self, qop: Qop, message: &[u8]) -> Result<TokenBuffer, Error> {
        let handle = self.established_handle("sign with")?;
        let mic = self.provider().get_mic(handle, qop, message)?;
        Ok(TokenBuffer::from_provider(mic))
    }
    /// Checks `mic` against `message` and returns the protection it was made with.
    pub fn verify_mic(&self, message: &[u8], mic: &[u8]) -> Result<Qop, Error> {
        let handle = self.established_handle("verify with")?;
        Ok(self.provider().verify_mic(handle, message, mic)?)
    }
    /// Seals `message`. The provider may grant integrity only; check
    /// [`Wrapped::was_encrypted`].
    pub fn wrap(&self, encrypt: bool, message: &[u8]) -> Result<Wrapped, Error> {
        self.wrap_with_qop(encrypt, Qop::DEFAULT, message)
    }
    pub fn wrap_with_qop(&self, encrypt: bool, qop: Qop, message: &[u8]) -> Result<Wrapped, Error> {
        let handle = self.established_handle("wrap with")?;
        let wrapped = self.provider().wrap(handle, encrypt, qop, message)?;
        Ok(Wrapped {
            token: TokenBuffer::from_provider(wrapped.token),
            encrypted: wrapped.confidential,
        })
    }
    pub fn unwrap(&self, token: &[u8]) -> Result<Unwrapped, Error> {
        let handle = self.established_handle("unwrap with")?;
        let unwrapped = self.provider().unwrap(handle, token)?;
        Ok(Unwrapped {
            message: TokenBuffer::from_provider(unwrapped.message),
            encrypted: unwrapped.confidential,
            qop: unwrapped.qop,
        })
    }
}

#[derive(Debug)]
pub struct Wrapped {
    token: TokenBuffer,
    encrypted: bool,
}
impl Wrapped {
    pub fn as_slice(&self) -> &[u8] {
        self.token.as_bytes()
    }
    pub fn was_encrypted(&self) -> bool {
        self.encrypted
    }
    pub fn into_token(self) -> TokenBuffer {
        self.token
    }
}
impl Deref for Wrapped {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}
impl AsRef<[u8]> for Wrapped {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[derive(Debug)]
pub struct Unwrapped {
    message: TokenBuffer,
    encrypted: bool,
    qop: Qop,
}
impl Unwrapped {
    pub fn as_slice(&self) -> &[u8] {
        self.message.as_bytes()
    }
    pub fn was_encrypted(&self) -> bool {
        self.encrypted
    }
    pub fn qop(&self) -> Qop {
        self.qop
    }
    /// Fails unless the message was protected with at least `required`.
    pub fn require_qop(self, required: Qop) -> Result<Self, Error> {
        if self.qop < required {
            return Err(Error::InsufficientQop {
                required,
                actual: self.qop,
            });
        }
        Ok(self)
    }
    pub fn into_message(self) -> TokenBuffer {
        self.message
    }
}
impl Deref for Unwrapped {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}
