//! Accelerator allocator access.
//!
//! Accelerator runtimes keep freed device memory in a caching allocator so
//! that the next allocation is cheap. That cache is process-wide state:
//! [`DeviceAllocator::global`] exposes it as a singleton that is initialized
//! once, either explicitly through [`DeviceAllocator::install`] or lazily
//! with [`NullBackend`] on first use.
//!
//! Releasing the cache is a request, not a guarantee. The backend may keep
//! memory reserved for as long as it likes.

use std::fmt;
use std::sync::OnceLock;
use tokblock_core::{AllocatorStats, Result, TokblockError};
use tracing::{debug, info};

/// Global allocator singleton using OnceLock for thread-safe lazy initialization.
static GLOBAL_ALLOCATOR: OnceLock<DeviceAllocator> = OnceLock::new();

/// Interface to an accelerator's caching allocator.
pub trait AllocatorBackend: Send + Sync {
    /// Backend name for logs (e.g. "cuda", "metal").
    fn name(&self) -> &str;

    /// Whether an accelerator is present.
    fn is_available(&self) -> bool;

    /// Reclaim host-side objects that still pin device memory.
    ///
    /// Called before every cache release, whether or not an accelerator is
    /// available.
    fn collect_garbage(&self) {}

    /// Return cached, unused blocks to the device.
    fn empty_cache(&self);

    /// Release memory held for inter-process sharing.
    fn ipc_collect(&self) {}

    /// Bytes occupied by live tensors.
    fn memory_allocated(&self) -> u64;

    /// Bytes reserved by the caching allocator.
    fn memory_reserved(&self) -> u64;
}

/// Backend for hosts without an accelerator.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

impl AllocatorBackend for NullBackend {
    fn name(&self) -> &str {
        "none"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn empty_cache(&self) {}

    fn memory_allocated(&self) -> u64 {
        0
    }

    fn memory_reserved(&self) -> u64 {
        0
    }
}

/// Handle to an accelerator allocator.
pub struct DeviceAllocator {
    backend: Box<dyn AllocatorBackend>,
}

impl DeviceAllocator {
    /// Standalone handle over `backend`.
    ///
    /// Prefer [`DeviceAllocator::global()`] unless you need an allocator
    /// that is not shared with the rest of the process.
    pub fn with_backend(backend: impl AllocatorBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// Install `backend` as the process-wide allocator.
    ///
    /// # Errors
    ///
    /// Returns [`TokblockError::Config`] if the global allocator was already
    /// initialized, either by an earlier `install` or by [`DeviceAllocator::global`].
    pub fn install(backend: impl AllocatorBackend + 'static) -> Result<&'static DeviceAllocator> {
        let mut installed = false;
        let allocator = GLOBAL_ALLOCATOR.get_or_init(|| {
            installed = true;
            Self::with_backend(backend)
        });

        if installed {
            info!("Installed device allocator backend: {}", allocator.backend_name());
            Ok(allocator)
        } else {
            Err(TokblockError::Config(format!(
                "device allocator already initialized with backend '{}'",
                allocator.backend_name()
            )))
        }
    }

    /// Get the process-wide allocator, initializing it with [`NullBackend`]
    /// if nothing was installed.
    pub fn global() -> &'static DeviceAllocator {
        GLOBAL_ALLOCATOR.get_or_init(|| {
            debug!("No device allocator installed, using null backend");
            Self::with_backend(NullBackend)
        })
    }

    /// Whether the process-wide allocator has been initialized.
    pub fn is_initialized() -> bool {
        GLOBAL_ALLOCATOR.get().is_some()
    }

    /// Backend name.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Whether an accelerator is present.
    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// Current allocator statistics, `None` without an accelerator.
    pub fn stats(&self) -> Option<AllocatorStats> {
        if !self.backend.is_available() {
            return None;
        }
        Some(AllocatorStats {
            allocated_bytes: self.backend.memory_allocated(),
            reserved_bytes: self.backend.memory_reserved(),
        })
    }

    /// Ask the backend to release cached memory.
    ///
    /// Advisory only: the backend may keep memory reserved.
    pub fn request_release(&self) {
        self.backend.collect_garbage();
        if self.backend.is_available() {
            self.backend.empty_cache();
            self.backend.ipc_collect();
            debug!("Requested cache release from {}", self.backend.name());
        }
    }

    /// Log current allocator statistics.
    pub fn log_stats(&self) {
        match self.stats() {
            Some(stats) => info!(
                "Memory allocated: {}, reserved: {}, cached: {} ({})",
                format_bytes(stats.allocated_bytes),
                format_bytes(stats.reserved_bytes),
                format_bytes(stats.cached_bytes()),
                self.backend.name()
            ),
            None => info!("Device allocator not available ({})", self.backend.name()),
        }
    }
}

impl fmt::Debug for DeviceAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocator")
            .field("backend", &self.backend.name())
            .field("available", &self.backend.is_available())
            .finish()
    }
}

/// Format bytes as human-readable string.
///
/// # Example
/// ```ignore
/// assert_eq!(format_bytes(1536), "1.5 KB");
/// assert_eq!(format_bytes(1073741824), "1.0 GB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
