//! Identity-compared keys for scope values.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque token used to bind and look up values on a [`Scope`](super::Scope).
///
/// Two keys are equal only if they are the same token: creating another
/// key with the same name yields a distinct key, so unrelated subsystems
/// cannot collide. The type parameter fixes the value type bound to it.
pub struct ScopeKey<T> {
    id: u64,
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> ScopeKey<T> {
    /// Creates a fresh key. `name` is only used for debugging.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
            _value: PhantomData,
        }
    }

    /// Returns the debugging name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Clone for ScopeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ScopeKey<T> {}

impl<T> PartialEq for ScopeKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ScopeKey<T> {}

impl<T> fmt::Debug for ScopeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeKey")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_with_same_name_differ() {
        let a: ScopeKey<u8> = ScopeKey::new("tenant");
        let b: ScopeKey<u8> = ScopeKey::new("tenant");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.name(), "tenant");
    }
}
