//! Releasing pipeline components between model loads.
//!
//! [`release`] runs three steps, always in this order and always to the end:
//!
//! 1. Move the model to host memory, best effort. A failure is logged and
//!    reported, never returned.
//! 2. Reset every slot of the [`PipelineHandle`] to absent, dropping the
//!    components it held.
//! 3. Ask the [`DeviceAllocator`] to release its cache.

use crate::allocator::DeviceAllocator;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tokblock_core::{AllocatorStats, ReclaimConfig, Result};
use tracing::{debug, info, warn};

/// A pipeline component that may hold device memory.
pub trait Component: Send {
    /// Component name for logs.
    fn name(&self) -> &str;

    /// Move device-resident tensors to host memory.
    ///
    /// Report failure by returning `Err`. A panic is caught by [`release`]
    /// and treated as a failed move. The default implementation holds
    /// nothing on the device.
    fn to_host(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Named component slots of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// The model weights.
    Model,
    /// Text tokenizer.
    Tokenizer,
    /// Audio feature extractor.
    FeatureExtractor,
    /// Image processor.
    ImageProcessor,
    /// Multimodal processor.
    Processor,
}

impl SlotKind {
    /// Every slot, in release order.
    pub const ALL: [SlotKind; 5] = [
        SlotKind::Model,
        SlotKind::Tokenizer,
        SlotKind::FeatureExtractor,
        SlotKind::ImageProcessor,
        SlotKind::Processor,
    ];

    /// Slot name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKind::Model => "model",
            SlotKind::Tokenizer => "tokenizer",
            SlotKind::FeatureExtractor => "feature_extractor",
            SlotKind::ImageProcessor => "image_processor",
            SlotKind::Processor => "processor",
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional components held by a pipeline.
#[derive(Default)]
pub struct PipelineHandle {
    model: Option<Box<dyn Component>>,
    tokenizer: Option<Box<dyn Component>>,
    feature_extractor: Option<Box<dyn Component>>,
    image_processor: Option<Box<dyn Component>>,
    processor: Option<Box<dyn Component>>,
}

impl PipelineHandle {
    /// Create a handle with every slot absent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill a slot, builder style.
    pub fn with(mut self, kind: SlotKind, component: impl Component + 'static) -> Self {
        self.set(kind, Box::new(component));
        self
    }

    /// Set the model.
    pub fn with_model(self, model: impl Component + 'static) -> Self {
        self.with(SlotKind::Model, model)
    }

    /// Set the tokenizer.
    pub fn with_tokenizer(self, tokenizer: impl Component + 'static) -> Self {
        self.with(SlotKind::Tokenizer, tokenizer)
    }

    /// Fill a slot, returning its previous component.
    pub fn set(
        &mut self,
        kind: SlotKind,
        component: Box<dyn Component>,
    ) -> Option<Box<dyn Component>> {
        self.slot_mut(kind).replace(component)
    }

    /// Empty a slot, returning its component.
    pub fn take(&mut self, kind: SlotKind) -> Option<Box<dyn Component>> {
        self.slot_mut(kind).take()
    }

    /// Borrow the component in a slot.
    pub fn get(&self, kind: SlotKind) -> Option<&dyn Component> {
        self.slot(kind).as_deref()
    }

    /// Whether a slot holds a component.
    pub fn is_present(&self, kind: SlotKind) -> bool {
        self.slot(kind).is_some()
    }

    /// Slots that hold a component.
    pub fn present_slots(&self) -> Vec<SlotKind> {
        SlotKind::ALL
            .into_iter()
            .filter(|kind| self.is_present(*kind))
            .collect()
    }

    /// Whether every slot is absent.
    pub fn is_empty(&self) -> bool {
        SlotKind::ALL.iter().all(|kind| !self.is_present(*kind))
    }

    fn slot(&self, kind: SlotKind) -> &Option<Box<dyn Component>> {
        match kind {
            SlotKind::Model => &self.model,
            SlotKind::Tokenizer => &self.tokenizer,
            SlotKind::FeatureExtractor => &self.feature_extractor,
            SlotKind::ImageProcessor => &self.image_processor,
            SlotKind::Processor => &self.processor,
        }
    }

    fn slot_mut(&mut self, kind: SlotKind) -> &mut Option<Box<dyn Component>> {
        match kind {
            SlotKind::Model => &mut self.model,
            SlotKind::Tokenizer => &mut self.tokenizer,
            SlotKind::FeatureExtractor => &mut self.feature_extractor,
            SlotKind::ImageProcessor => &mut self.image_processor,
            SlotKind::Processor => &mut self.processor,
        }
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("PipelineHandle");
        for kind in SlotKind::ALL {
            s.field(kind.as_str(), &self.get(kind).map(Component::name));
        }
        s.finish()
    }
}

/// What happened when moving the model to host memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffloadOutcome {
    /// The model was moved.
    Moved,
    /// The move failed; release continued anyway.
    Failed(String),
    /// There was no model to move.
    NoModel,
}

impl OffloadOutcome {
    /// Whether the move failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Summary of one release.
#[derive(Debug, Clone)]
pub struct ReleaseReport {
    /// Result of the model offload.
    pub offload: OffloadOutcome,
    /// Slots that held a component and were cleared.
    pub cleared: Vec<SlotKind>,
    /// Allocator stats before release (`None` without an accelerator).
    pub before: Option<AllocatorStats>,
    /// Allocator stats after release (`None` without an accelerator).
    pub after: Option<AllocatorStats>,
}

impl ReleaseReport {
    /// Reserved bytes the allocator gave back, if it reported stats.
    pub fn freed_bytes(&self) -> Option<u64> {
        match (self.before, self.after) {
            (Some(before), Some(after)) => {
                Some(before.reserved_bytes.saturating_sub(after.reserved_bytes))
            }
            _ => None,
        }
    }
}

/// Release every component of `handle` and request a cache release.
///
/// Never fails. The handle is left with every slot absent and can be
/// refilled.
pub fn release(handle: &mut PipelineHandle, allocator: &DeviceAllocator) -> ReleaseReport {
    release_with_config(handle, allocator, &ReclaimConfig::default())
}

/// [`release`] with explicit configuration.
pub fn release_with_config(
    handle: &mut PipelineHandle,
    allocator: &DeviceAllocator,
    config: &ReclaimConfig,
) -> ReleaseReport {
    debug!(slots = ?handle.present_slots(), "Releasing pipeline references");

    let before = allocator.stats();
    if config.log_stats {
        allocator.log_stats();
    }

    let offload = match handle.model.as_deref_mut() {
        Some(model) => offload_to_host(model),
        None => OffloadOutcome::NoModel,
    };

    let mut cleared = Vec::new();
    for kind in SlotKind::ALL {
        if let Some(component) = handle.take(kind) {
            debug!(slot = %kind, component = component.name(), "Dropping component");
            drop(component);
            cleared.push(kind);
        }
    }

    allocator.request_release();

    let after = allocator.stats();
    if config.log_stats {
        allocator.log_stats();
    }

    let report = ReleaseReport {
        offload,
        cleared,
        before,
        after,
    };
    info!(
        "Released {} pipeline components (offload: {:?}, freed: {})",
        report.cleared.len(),
        report.offload,
        report
            .freed_bytes()
            .map_or_else(|| "n/a".to_string(), crate::allocator::format_bytes)
    );
    report
}

/// Release a standalone model and its optional tokenizer.
pub fn release_model(
    model: Box<dyn Component>,
    tokenizer: Option<Box<dyn Component>>,
    allocator: &DeviceAllocator,
) -> ReleaseReport {
    let mut handle = PipelineHandle::new();
    handle.set(SlotKind::Model, model);
    if let Some(tokenizer) = tokenizer {
        handle.set(SlotKind::Tokenizer, tokenizer);
    }
    release(&mut handle, allocator)
}

fn offload_to_host(model: &mut dyn Component) -> OffloadOutcome {
    // The component is dropped right after, so a half-moved state is never observed.
    let moved = panic::catch_unwind(AssertUnwindSafe(|| model.to_host()));
    let reason = match moved {
        Ok(Ok(())) => return OffloadOutcome::Moved,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };
    warn!(
        "Failed to move {} to host memory, continuing release: {}",
        model.name(),
        reason
    );
    OffloadOutcome::Failed(reason)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

/// Requests a cache release when dropped.
///
/// # Example
/// ```ignore
/// {
///     let _guard = ReclaimGuard::new(DeviceAllocator::global());
///     // Load and run a model here
/// } // Cache release requested
/// ```
pub struct ReclaimGuard<'a> {
    allocator: &'a DeviceAllocator,
}

impl<'a> ReclaimGuard<'a> {
    /// Create a guard over `allocator`.
    pub fn new(allocator: &'a DeviceAllocator) -> Self {
        Self { allocator }
    }
}

impl ReclaimGuard<'static> {
    /// Create a guard over the process-wide allocator.
    pub fn global() -> Self {
        Self::new(DeviceAllocator::global())
    }
}

impl Drop for ReclaimGuard<'_> {
    fn drop(&mut self) {
        self.allocator.request_release();
    }
}
