use std::{borrow::Cow, fmt, mem};

use tracing::warn;

use crate::{error::ProviderError, name::Principal, oid::Oid, provider::Provider, Error};

/// Memory produced by a security provider and owned by the caller until released.
///
/// Providers hand out allocations through this trait so that [`TokenBuffer`] can free them
/// through the same library that made them.
pub trait ProviderAllocation: Send {
    fn as_slice(&self) -> &[u8];
    /// Returns the memory to its provider. Consuming the box makes a second release
    /// impossible.
    fn release(self: Box<Self>) -> Result<(), ProviderError>;
}

/// Who is responsible for freeing a [`TokenBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Empty or already released. Releasing is a no-op.
    None,
    /// Copied from caller data, freed by the allocator.
    LocallyOwned,
    /// Returned by a provider call, freed by that provider.
    ProviderOwned,
}

enum Storage {
    Empty,
    Local(Box<[u8]>),
    Provider(Box<dyn ProviderAllocation>),
}

/// An opaque token or name buffer with a single release path.
///
/// Dropping a buffer releases it and ignores provider failures. Call [`TokenBuffer::release`]
/// to see them.
pub struct TokenBuffer {
    storage: Storage,
}
impl TokenBuffer {
    pub const fn empty() -> Self {
        Self { storage: Storage::Empty }
    }
    /// Copies `data` into a locally owned buffer. Empty input yields the empty buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        if data.is_empty() {
            return Self::empty();
        }
        Self {
            storage: Storage::Local(data.into()),
        }
    }
    /// Like [`TokenBuffer::from_bytes`], but reports allocation failure instead of aborting.
    pub fn try_from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.is_empty() {
            return Ok(Self::empty());
        }
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(data.len())
            .map_err(|_| Error::Allocation(data.len()))?;
        owned.extend_from_slice(data);
        Ok(Self {
            storage: Storage::Local(owned.into_boxed_slice()),
        })
    }
    pub fn from_text(text: &str) -> Self {
        Self::from_bytes(text.as_bytes())
    }
    /// Takes ownership of provider memory. Even an empty allocation is kept so that it is
    /// released through its provider.
    pub fn from_provider(allocation: Box<dyn ProviderAllocation>) -> Self {
        Self {
            storage: Storage::Provider(allocation),
        }
    }
    pub fn origin(&self) -> Origin {
        match self.storage {
            Storage::Empty => Origin::None,
            Storage::Local(_) => Origin::LocallyOwned,
            Storage::Provider(_) => Origin::ProviderOwned,
        }
    }
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Empty => &[],
            Storage::Local(data) => data,
            Storage::Provider(allocation) => allocation.as_slice(),
        }
    }
    /// The contents as text, with invalid UTF-8 replaced.
    pub fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }
    /// Byte equality. A buffer with origin [`Origin::None`] equals nothing, not even
    /// another empty buffer.
    pub fn equals(&self, other: &TokenBuffer) -> bool {
        if self.origin() == Origin::None || other.origin() == Origin::None {
            return false;
        }
        self.as_bytes() == other.as_bytes()
    }
    /// Frees the contents through the path matching their origin. The buffer is empty
    /// afterwards, even if the provider reported a failure.
    pub fn release(&mut self) -> Result<(), ProviderError> {
        match mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Empty | Storage::Local(_) => Ok(()),
            Storage::Provider(allocation) => allocation.release(),
        }
    }
    pub fn to_principal(&self, provider: &Provider, name_type: &Oid) -> Result<Principal, Error> {
        Principal::import(provider, self, name_type)
    }
    /// Copies the contents out and releases the buffer.
    pub fn into_vec(mut self) -> Vec<u8> {
        let data = self.as_bytes().to_vec();
        if let Err(err) = self.release() {
            warn!(%err, "failed to release provider buffer");
        }
        data
    }
}
impl Drop for TokenBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(%err, "failed to release provider buffer");
        }
    }
}
impl Default for TokenBuffer {
    fn default() -> Self {
        Self::empty()
    }
}
impl From<Vec<u8>> for TokenBuffer {
    fn from(data: Vec<u8>) -> Self {
        if data.is_empty() {
            return Self::empty();
        }
        Self {
            storage: Storage::Local(data.into_boxed_slice()),
        }
    }
}
impl AsRef<[u8]> for TokenBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
impl PartialEq for TokenBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}
impl fmt::Debug for TokenBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBuffer")
            .field("origin", &self.origin())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::error::MajorStatus;

    struct Counted {
        data: Vec<u8>,
        released: Arc<AtomicUsize>,
        fail: bool,
    }
    impl ProviderAllocation for Counted {
        fn as_slice(&self) -> &[u8] {
            &self.data
        }
        fn release(self: Box<Self>) -> Result<(), ProviderError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProviderError::new(MajorStatus::FAILURE, 1, "release refused"))
            } else {
                Ok(())
            }
        }
    }
    fn counted(data: &[u8], fail: bool) -> (TokenBuffer, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let buffer = TokenBuffer::from_provider(Box::new(Counted {
            data: data.to_vec(),
            released: released.clone(),
            fail,
        }));
        (buffer, released)
    }

    #[test]
    fn empty_input_is_the_empty_sentinel() {
        let mut buffer = TokenBuffer::from_bytes(b"");
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.origin(), Origin::None);
        assert!(buffer.release().is_ok());
        assert_eq!(TokenBuffer::from(Vec::new()).origin(), Origin::None);
    }

    #[test]
    fn text_buffers_are_locally_owned() {
        let buffer = TokenBuffer::from_text("HTTP@example.com");
        assert_eq!(buffer.origin(), Origin::LocallyOwned);
        assert_eq!(buffer.as_text(), "HTTP@example.com");
        assert_eq!(buffer.len(), 16);
    }

    #[test]
    fn release_is_idempotent() {
        let mut buffer = TokenBuffer::from_bytes(b"token");
        buffer.release().unwrap();
        assert_eq!(buffer.origin(), Origin::None);
        assert!(buffer.as_bytes().is_empty());
        assert_eq!(buffer.as_text(), "");
        buffer.release().unwrap();
    }

    #[test]
    fn provider_memory_is_released_once() {
        let (mut buffer, released) = counted(b"abc", false);
        assert_eq!(buffer.origin(), Origin::ProviderOwned);
        buffer.release().unwrap();
        buffer.release().unwrap();
        drop(buffer);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_provider_memory() {
        let (buffer, released) = counted(b"", false);
        assert!(buffer.is_empty());
        drop(buffer);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_release_still_empties_the_buffer() {
        let (mut buffer, released) = counted(b"abc", true);
        let err = buffer.release().unwrap_err();
        assert_eq!(err.major, MajorStatus::FAILURE);
        assert_eq!(buffer.origin(), Origin::None);
        buffer.release().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn equality_ignores_origin_but_not_emptiness() {
        let (provider, _) = counted(b"abc", false);
        let local = TokenBuffer::from_bytes(b"abc");
        assert!(local.equals(&provider));
        assert!(!local.equals(&TokenBuffer::from_bytes(b"abd")));
        assert!(!TokenBuffer::empty().equals(&TokenBuffer::empty()));
        assert!(!local.equals(&TokenBuffer::empty()));
    }

    #[test]
    fn into_vec_copies_before_release() {
        let (buffer, released) = counted(b"payload", false);
        assert_eq!(buffer.into_vec(), b"payload");
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::super::*;

        proptest! {
            #[test]
            fn bytes_survive_a_local_buffer(data in proptest::collection::vec(any::<u8>(), 0..512)) {
                let buffer = TokenBuffer::from_bytes(&data);
                prop_assert_eq!(buffer.len(), data.len());
                prop_assert_eq!(buffer.as_bytes(), &data[..]);
                let fallible = TokenBuffer::try_from_bytes(&data).unwrap();
                prop_assert_eq!(fallible.as_bytes(), &data[..]);
            }
        }
    }
}
