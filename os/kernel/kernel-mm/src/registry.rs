//! Reverse lookup from a translation root to the [`Space`] it belongs to.

use crate::{Platform, Space};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::SpinLock;
use log::trace;

/// Root address → space table used by the page fault path.
///
/// Entries are weak: the registry never keeps a space alive. A space that is
/// being torn down is no longer found even before it deregisters.
pub struct DirectoryRegistry<P: Platform> {
    spaces: SpinLock<BTreeMap<PhysicalAddress, Weak<Space<P>>>>,
}

impl<P: Platform> DirectoryRegistry<P> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            spaces: SpinLock::new(BTreeMap::new()),
        }
    }

    /// # Panics
    /// Panics if `root` is already registered; roots are exclusively owned
    /// frames, so a duplicate means a frame was handed out twice.
    pub fn register(&self, root: PhysicalAddress, space: Weak<Space<P>>) {
        self.spaces.with_lock(|spaces| {
            let previous = spaces.insert(root, space);
            assert!(previous.is_none(), "translation root {root} registered twice");
        });
        trace!("registered address space {root}");
    }

    /// Returns `false` if `root` was not registered.
    pub fn deregister(&self, root: PhysicalAddress) -> bool {
        let removed = self.spaces.with_lock(|spaces| spaces.remove(&root));
        trace!("deregistered address space {root}");
        removed.is_some()
    }

    /// The live space whose translation tree is rooted at `root`.
    #[must_use]
    pub fn find_by_root(&self, root: PhysicalAddress) -> Option<Arc<Space<P>>> {
        self.spaces
            .with_lock(|spaces| spaces.get(&root).and_then(Weak::upgrade))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.spaces.with_lock(|spaces| spaces.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: Platform> Default for DirectoryRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> core::fmt::Debug for DirectoryRegistry<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DirectoryRegistry")
            .field("spaces", &self.len())
            .finish()
    }
}
