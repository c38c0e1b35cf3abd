use kernel_vmem::MapError;

/// Recoverable failures of memory manager operations.
///
/// Exhaustion is reported, never retried here; the syscall layer turns these
/// into its own error codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("out of virtual address space")]
    OutOfAddressSpace,
    #[error("invalid address range")]
    InvalidRange,
    #[error("no region covers the requested range")]
    NoSuchRegion,
    #[error("page directory could not be constructed")]
    DirectoryConstruction,
    #[error("invalid memory manager configuration")]
    InvalidConfiguration,
    #[error(transparent)]
    Map(#[from] MapError),
}
