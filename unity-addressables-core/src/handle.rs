//! Operation handles
//!
//! A handle is a copyable `(slot, version)` pair naming an operation owned by a
//! [`ResourceManager`](crate::ResourceManager). It never owns the operation;
//! once the operation is recycled its version moves on and the handle goes
//! stale. Every manager call validates the version before touching the slot.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

const INVALID_INDEX: u32 = u32::MAX;

/// Type-erased reference to an operation at a specific version.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle {
    index: u32,
    version: u32,
}

impl Handle {
    /// A handle that was never issued by a manager.
    pub const INVALID: Handle = Handle {
        index: INVALID_INDEX,
        version: 0,
    };

    pub(crate) const fn new(index: u32, version: u32) -> Self {
        Self { index, version }
    }

    /// Slot index of the operation
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Version stamp the handle was issued at
    pub const fn version(self) -> u32 {
        self.version
    }

    /// False for [`Handle::INVALID`]. A structurally valid handle may still be
    /// stale; use [`ResourceManager::is_valid`](crate::ResourceManager::is_valid)
    /// to check liveness.
    pub const fn is_valid(self) -> bool {
        self.index != INVALID_INDEX
    }

    /// Reinterpret as a typed handle. The type is checked when the result is read.
    pub fn typed<T: 'static>(self) -> AsyncOperationHandle<T> {
        AsyncOperationHandle {
            handle: self,
            _marker: PhantomData,
        }
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Handle({}v{})", self.index, self.version)
        } else {
            f.write_str("Handle(invalid)")
        }
    }
}

/// Handle to an operation producing a `T`.
pub struct AsyncOperationHandle<T> {
    handle: Handle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AsyncOperationHandle<T> {
    /// The type-erased handle
    pub fn typeless(&self) -> Handle {
        self.handle
    }

    /// See [`Handle::is_valid`]
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Version stamp the handle was issued at
    pub fn version(&self) -> u32 {
        self.handle.version
    }
}

impl<T> Clone for AsyncOperationHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AsyncOperationHandle<T> {}

impl<T> PartialEq for AsyncOperationHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl<T> Eq for AsyncOperationHandle<T> {}

impl<T> Hash for AsyncOperationHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl<T> Default for AsyncOperationHandle<T> {
    fn default() -> Self {
        Self {
            handle: Handle::INVALID,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AsyncOperationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AsyncOperationHandle<{}>({:?})",
            std::any::type_name::<T>(),
            self.handle
        )
    }
}

impl<T> From<AsyncOperationHandle<T>> for Handle {
    fn from(handle: AsyncOperationHandle<T>) -> Self {
        handle.handle
    }
}
