//! # Regions
//!
//! A [`Region`] is one installed mapping of a [`Space`](crate::Space): a
//! virtual range, the [`VmObject`] behind it, and the permissions it is
//! mapped with. Regions are immutable; splitting or reprotecting one
//! replaces it with new regions over the same object.

use crate::{MemoryError, VmObject};
use alloc::string::String;
use alloc::sync::Arc;
use kernel_memory_addresses::{PAGE_SIZE, Range, VirtualAddress};
use kernel_vmem::PageFlags;
use utils_accessors_derive::Setters;

/// What a region may be used for.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Setters)]
#[setters(with_only)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Access {
    pub const NONE: Self = Self {
        read: false,
        write: false,
        execute: false,
    };
    pub const READ_ONLY: Self = Self::NONE.with_read(true);
    pub const READ_WRITE: Self = Self::READ_ONLY.with_write(true);
    pub const READ_EXECUTE: Self = Self::READ_ONLY.with_execute(true);

    /// `true` if an access of `kind` is allowed.
    #[must_use]
    pub const fn permits(self, kind: AccessKind) -> bool {
        match kind {
            AccessKind::Read => self.read,
            AccessKind::Write => self.write,
            AccessKind::Execute => self.execute,
        }
    }

    /// Leaf permissions for a userspace mapping with this access.
    #[must_use]
    pub const fn page_flags(self) -> PageFlags {
        PageFlags::user_read_only()
            .with_writable(self.write)
            .with_no_execute(!self.execute)
    }
}

/// The kind of a memory access, as reported by a page fault.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Properties of a region that do not affect its mapping.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Setters)]
#[setters(with_only)]
pub struct RegionFlags {
    /// Shared with other spaces (not copied on fork).
    pub shared: bool,
    /// A thread stack.
    pub stack: bool,
    /// Created by an `mmap`-style request.
    pub mmap: bool,
}

/// One mapping of a [`Space`](crate::Space).
#[derive(Debug)]
pub struct Region {
    range: Range,
    vmobject: Arc<VmObject>,
    offset_in_vmobject: u64,
    access: Access,
    name: String,
    flags: RegionFlags,
}

impl Region {
    /// # Panics
    /// Panics if `range` is empty or not page granular, if the offset is not
    /// page aligned, or if the range reaches past the end of `vmobject`.
    pub fn new(
        range: Range,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: u64,
        access: Access,
        name: impl Into<String>,
        flags: RegionFlags,
    ) -> Self {
        assert!(
            !range.is_empty()
                && range.base().is_page_aligned()
                && range.size().is_multiple_of(PAGE_SIZE)
                && offset_in_vmobject.is_multiple_of(PAGE_SIZE),
            "region {range} at offset {offset_in_vmobject:#x} is not page granular"
        );
        assert!(
            offset_in_vmobject
                .checked_add(range.size())
                .is_some_and(|end| end <= vmobject.size()),
            "region {range} extends past its VM object"
        );
        Self {
            range,
            vmobject,
            offset_in_vmobject,
            access,
            name: name.into(),
            flags,
        }
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> Range {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn vmobject(&self) -> &Arc<VmObject> {
        &self.vmobject
    }

    #[inline]
    #[must_use]
    pub const fn offset_in_vmobject(&self) -> u64 {
        self.offset_in_vmobject
    }

    #[inline]
    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// Leaf permissions for pages of this region.
    #[must_use]
    pub fn page_flags(&self) -> PageFlags {
        let flags = self.access.page_flags();
        if self.vmobject.is_physical() {
            flags.uncached()
        } else {
            flags
        }
    }

    /// Index of the VM object page that backs `va`.
    #[must_use]
    pub fn vmobject_page_index(&self, va: VirtualAddress) -> Option<usize> {
        if !self.range.contains_address(va) {
            return None;
        }
        let offset = va.page_base().offset_from(self.range.base())?;
        usize::try_from((self.offset_in_vmobject + offset) / PAGE_SIZE).ok()
    }

    /// A region over `range` (which must lie inside this one) mapping the
    /// same bytes of the same object.
    ///
    /// # Errors
    /// [`MemoryError::InvalidRange`] if `range` is not inside this region.
    pub fn clone_with_range(&self, range: Range) -> Result<Self, MemoryError> {
        if range.is_empty() || !self.range.contains(&range) {
            return Err(MemoryError::InvalidRange);
        }
        let displacement = range
            .base()
            .offset_from(self.range.base())
            .ok_or(MemoryError::InvalidRange)?;
        Ok(Self {
            range,
            vmobject: Arc::clone(&self.vmobject),
            offset_in_vmobject: self.offset_in_vmobject + displacement,
            access: self.access,
            name: self.name.clone(),
            flags: self.flags,
        })
    }

    /// This region with different permissions.
    #[must_use]
    pub fn with_access(&self, access: Access) -> Self {
        Self {
            range: self.range,
            vmobject: Arc::clone(&self.vmobject),
            offset_in_vmobject: self.offset_in_vmobject,
            access,
            name: self.name.clone(),
            flags: self.flags,
        }
    }
}
