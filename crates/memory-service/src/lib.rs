//! The process-wide owner of the heap and the scratch arena.
//!
//! [`MemoryService`] is a context object: it is built once at process start
//! with [`MemoryService::init`], passed by reference to every component that
//! needs memory, and consumed by [`MemoryService::shutdown`]. Containers bind
//! to one of its allocators through [`MemoryService::allocator`].
//!
//! ```
//! use containers::StringBuffer;
//! use memory_service::{MemoryConfig, MemoryService, Region};
//!
//! let mut service = MemoryService::init(&MemoryConfig { heap_size: 1 << 16 }).unwrap();
//! service.init_scratch(1024).unwrap();
//! {
//!     let heap = service.allocator(Region::Heap).unwrap();
//!     let name = StringBuffer::with_text(heap, b"sol").unwrap();
//!     assert_eq!(name.as_bytes(), b"sol");
//! }
//! service.shutdown().unwrap();
//! ```

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use allocator::{
    AllocatorRef, MemoryError,
    error::{AlreadyInitializedSnafu, NotInitializedSnafu, report_violation},
    heap::HeapStats,
    linear::LinearAllocator,
};
use cfg_if::cfg_if;
use derive_more::Display;
use snafu::OptionExt as _;

pub use self::config::{DEFAULT_HEAP_SIZE, MemoryConfig};

mod config;

cfg_if! {
    if #[cfg(feature = "track-allocations")] {
        /// Heap flavor owned by the service: records every live handle.
        pub type SystemHeap = allocator::tracking::Tracking<allocator::heap::HeapAllocator>;
    } else {
        /// Heap flavor owned by the service.
        pub type SystemHeap = allocator::heap::HeapAllocator;
    }
}

const SCRATCH: &str = "scratch allocator";

/// Which of the service's allocators to bind to.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    #[display("heap")]
    Heap,
    #[display("scratch")]
    Scratch,
}

/// Owner of exactly one heap and at most one scratch arena.
#[derive(Debug)]
pub struct MemoryService {
    config: MemoryConfig,
    heap: SystemHeap,
    scratch: Option<LinearAllocator>,
}

impl MemoryService {
    /// Creates the heap sized by `config`.
    ///
    /// The scratch arena is created separately by its first consumer through
    /// [`init_scratch`](Self::init_scratch).
    pub fn init(config: &MemoryConfig) -> Result<Self, MemoryError> {
        let heap = SystemHeap::init(config.heap_size)?;
        tracing::info!(heap_size = config.heap_size, "memory service initialized");
        Ok(Self {
            config: *config,
            heap,
            scratch: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[must_use]
    pub fn heap(&self) -> &SystemHeap {
        &self.heap
    }

    /// Creates the scratch arena with `size` bytes.
    pub fn init_scratch(&mut self, size: usize) -> Result<&LinearAllocator, MemoryError> {
        if self.scratch.is_some() {
            return AlreadyInitializedSnafu { what: SCRATCH }
                .fail()
                .inspect_err(report_violation);
        }
        let scratch = LinearAllocator::init(size)?;
        Ok(self.scratch.insert(scratch))
    }

    pub fn scratch(&self) -> Result<&LinearAllocator, MemoryError> {
        self.scratch
            .as_ref()
            .context(NotInitializedSnafu { what: SCRATCH })
            .inspect_err(report_violation)
    }

    /// Mutable access, needed to `cut` or `free` the arena.
    pub fn scratch_mut(&mut self) -> Result<&mut LinearAllocator, MemoryError> {
        self.scratch
            .as_mut()
            .context(NotInitializedSnafu { what: SCRATCH })
            .inspect_err(report_violation)
    }

    /// A handle to the allocator backing `region`.
    pub fn allocator(&self, region: Region) -> Result<AllocatorRef<'_, SystemHeap>, MemoryError> {
        match region {
            Region::Heap => Ok(AllocatorRef::Heap(&self.heap)),
            Region::Scratch => self.scratch().map(AllocatorRef::from),
        }
    }

    /// Releases the scratch arena and shuts the heap down.
    ///
    /// Fails with [`MemoryError::UnreleasedMemory`] if any heap allocation is
    /// still live.
    pub fn shutdown(self) -> Result<HeapStats, MemoryError> {
        if let Some(scratch) = self.scratch {
            scratch.kill();
        }
        let stats = self.heap.shutdown()?;
        tracing::info!("memory service shut down");
        Ok(stats)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use allocator::Allocator as _;
    use containers::{StringBuffer, Vec};
    use tracing::subscriber::DefaultGuard;

    use super::*;

    fn init_logging() -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn test_service() -> MemoryService {
        let config: MemoryConfig = toml::from_str("heap_size = 65536").unwrap();
        MemoryService::init(&config).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let _guard = init_logging();
        let mut service = test_service();
        assert_eq!(service.config().heap_size, 65536);
        service.init_scratch(4096).unwrap();
        {
            let heap = service.allocator(Region::Heap).unwrap();
            let scratch = service.allocator(Region::Scratch).unwrap();
            assert!(heap.kind().is_heap());
            assert!(scratch.kind().is_linear());

            let mut numbers = Vec::<u32, _>::init(heap, 2, 1).unwrap();
            let mut words = StringBuffer::init(scratch, 4).unwrap();
            for i in 0..10 {
                numbers.push(i).unwrap();
            }
            words.push_str("scratch space").unwrap();
            assert_eq!(numbers.len(), 10);
            assert_eq!(words.as_str().unwrap(), "scratch space");
            assert!(service.heap().allocated() > 0);
        }
        assert_eq!(service.heap().allocated(), 0);
        assert!(service.scratch().unwrap().used() > 0);
        service.scratch_mut().unwrap().free();
        assert_eq!(service.scratch().unwrap().used(), 0);

        let stats = service.shutdown().unwrap();
        assert_eq!(stats.total_bytes, 65536);
        assert_eq!(stats.used_blocks, 0);
    }

    #[test]
    fn test_scratch_lifecycle_errors() {
        let _guard = init_logging();
        let mut service = test_service();
        let err = service.allocator(Region::Scratch).unwrap_err();
        assert!(matches!(err, MemoryError::NotInitialized { what: "scratch allocator", .. }));

        service.init_scratch(128).unwrap();
        let err = service.init_scratch(128).unwrap_err();
        assert!(matches!(err, MemoryError::AlreadyInitialized { .. }));
        service.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_reports_leak() {
        let _guard = init_logging();
        let service = test_service();
        let _leak = service.heap().allocate(200, 1).unwrap();
        let err = service.shutdown().unwrap_err();
        assert!(matches!(err, MemoryError::UnreleasedMemory { allocated: 208, live: 1, .. }));
    }

    #[test]
    fn test_rejects_undersized_heap() {
        let err = MemoryService::init(&MemoryConfig { heap_size: 16 }).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidRegionSize { size: 16, .. }));
    }

    #[test]
    fn test_region_display() {
        assert_eq!(Region::Heap.to_string(), "heap");
        assert_eq!(Region::Scratch.to_string(), "scratch");
    }
}
