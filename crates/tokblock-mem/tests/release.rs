//! Pipeline release integration tests.
//!
//! NOTE: Tests touching the process-wide allocator run serially. The global
//! can only be installed once per test binary, so every such test goes
//! through `global_calls()`.

use parking_lot::Mutex;
use serial_test::serial;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokblock_core::{ReclaimConfig, Result, TokblockError};
use tokblock_mem::{
    release, release_model, release_with_config, AllocatorBackend, Component, DeviceAllocator,
    NullBackend, OffloadOutcome, PipelineHandle, ReclaimGuard, SlotKind,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared view of what a backend was asked to do.
#[derive(Default)]
struct Calls {
    events: Mutex<Vec<&'static str>>,
    reserved: AtomicU64,
    releases: AtomicUsize,
}

impl Calls {
    fn record(&self, event: &'static str) {
        self.events.lock().push(event);
    }

    fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Simulates a caching allocator whose cache drains on `empty_cache`.
struct RecordingBackend {
    calls: Arc<Calls>,
}

impl AllocatorBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn collect_garbage(&self) {
        self.calls.record("gc");
    }

    fn empty_cache(&self) {
        self.calls.record("empty_cache");
        self.calls.releases.fetch_add(1, Ordering::SeqCst);
        self.calls.reserved.store(1024, Ordering::SeqCst);
    }

    fn ipc_collect(&self) {
        self.calls.record("ipc_collect");
    }

    fn memory_allocated(&self) -> u64 {
        1024
    }

    fn memory_reserved(&self) -> u64 {
        self.calls.reserved.load(Ordering::SeqCst)
    }
}

fn recording(reserved: u64) -> (DeviceAllocator, Arc<Calls>) {
    let calls = Arc::new(Calls::default());
    calls.reserved.store(reserved, Ordering::SeqCst);
    let allocator = DeviceAllocator::with_backend(RecordingBackend {
        calls: Arc::clone(&calls),
    });
    (allocator, calls)
}

fn global_calls() -> &'static Arc<Calls> {
    static CALLS: OnceLock<Arc<Calls>> = OnceLock::new();
    CALLS.get_or_init(|| {
        let calls = Arc::new(Calls::default());
        DeviceAllocator::install(RecordingBackend {
            calls: Arc::clone(&calls),
        })
        .expect("global allocator is installed exactly once");
        calls
    })
}

/// A model whose weights live on the device until moved.
struct FakeModel {
    on_device: Arc<AtomicUsize>,
    fail: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl Component for FakeModel {
    fn name(&self) -> &str {
        "fake-model"
    }

    fn to_host(&mut self) -> Result<()> {
        if self.fail {
            return Err(TokblockError::Device("out of host memory".to_string()));
        }
        self.on_device.store(0, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeModel {
    fn drop(&mut self) {
        self.log.lock().push("model dropped".to_string());
    }
}

struct FakeTokenizer;

impl Component for FakeTokenizer {
    fn name(&self) -> &str {
        "fake-tokenizer"
    }
}

fn fake_model(fail: bool) -> (FakeModel, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
    let on_device = Arc::new(AtomicUsize::new(1));
    let log = Arc::new(Mutex::new(Vec::new()));
    let model = FakeModel {
        on_device: Arc::clone(&on_device),
        fail,
        log: Arc::clone(&log),
    };
    (model, on_device, log)
}

#[test]
fn test_release_moves_model_then_requests_cache_release() {
    init_tracing();
    let (allocator, calls) = recording(8192);
    let (model, on_device, log) = fake_model(false);

    let mut handle = PipelineHandle::new()
        .with_model(model)
        .with_tokenizer(FakeTokenizer);

    let report = release(&mut handle, &allocator);

    assert_eq!(report.offload, OffloadOutcome::Moved);
    assert_eq!(on_device.load(Ordering::SeqCst), 0);
    assert_eq!(log.lock().as_slice(), ["model dropped"]);
    assert!(handle.is_empty());
    assert_eq!(calls.events(), vec!["gc", "empty_cache", "ipc_collect"]);
    assert_eq!(report.freed_bytes(), Some(8192 - 1024));
}

#[test]
fn test_release_continues_after_failed_offload() {
    init_tracing();
    let (allocator, calls) = recording(4096);
    let (model, on_device, log) = fake_model(true);

    let mut handle = PipelineHandle::new()
        .with_model(model)
        .with_tokenizer(FakeTokenizer)
        .with(SlotKind::FeatureExtractor, FakeTokenizer);

    let report = release(&mut handle, &allocator);

    match &report.offload {
        OffloadOutcome::Failed(msg) => assert!(msg.contains("out of host memory")),
        other => panic!("expected failed offload, got {other:?}"),
    }
    // Still on the device, but every reference is gone
    assert_eq!(on_device.load(Ordering::SeqCst), 1);
    assert_eq!(log.lock().len(), 1);
    assert!(handle.is_empty());
    assert_eq!(calls.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handle_can_be_refilled_after_release() {
    let (allocator, _) = recording(0);
    let (model, _, _) = fake_model(false);
    let mut handle = PipelineHandle::new().with_model(model);

    release(&mut handle, &allocator);
    assert!(!handle.is_present(SlotKind::Model));

    let (next, _, _) = fake_model(false);
    handle.set(SlotKind::Model, Box::new(next));
    assert!(handle.is_present(SlotKind::Model));
}

#[test]
fn test_release_model_with_tokenizer() {
    let (allocator, calls) = recording(2048);
    let (model, on_device, log) = fake_model(false);

    let report = release_model(Box::new(model), Some(Box::new(FakeTokenizer)), &allocator);

    assert_eq!(report.cleared, vec![SlotKind::Model, SlotKind::Tokenizer]);
    assert_eq!(on_device.load(Ordering::SeqCst), 0);
    assert_eq!(log.lock().len(), 1);
    assert_eq!(calls.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_release_without_accelerator() {
    let allocator = DeviceAllocator::with_backend(NullBackend);
    let (model, on_device, _) = fake_model(false);

    let report = release_model(Box::new(model), None, &allocator);

    assert_eq!(report.offload, OffloadOutcome::Moved);
    assert_eq!(on_device.load(Ordering::SeqCst), 0);
    assert!(report.before.is_none());
    assert!(report.after.is_none());
}

#[test]
fn test_release_quietly() {
    let (allocator, calls) = recording(2048);
    let mut handle = PipelineHandle::new().with_tokenizer(FakeTokenizer);

    let config = ReclaimConfig { log_stats: false };
    let report = release_with_config(&mut handle, &allocator, &config);

    assert_eq!(report.cleared, vec![SlotKind::Tokenizer]);
    assert_eq!(calls.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_guard_requests_release_on_drop() {
    let (allocator, calls) = recording(2048);
    {
        let _guard = ReclaimGuard::new(&allocator);
        assert_eq!(calls.releases.load(Ordering::SeqCst), 0);
    }
    assert_eq!(calls.releases.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn test_global_allocator_is_initialized_once() {
    let calls = global_calls();
    assert!(DeviceAllocator::is_initialized());
    assert_eq!(DeviceAllocator::global().backend_name(), "recording");

    let err = DeviceAllocator::install(NullBackend).unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("recording"));

    // The failed install left the original backend in place
    calls.clear();
    DeviceAllocator::global().request_release();
    assert_eq!(calls.events(), vec!["gc", "empty_cache", "ipc_collect"]);
}

#[test]
#[serial]
fn test_global_guard_and_release() {
    let calls = global_calls();
    calls.clear();

    {
        let _guard = ReclaimGuard::global();
        let mut handle = PipelineHandle::new().with_tokenizer(FakeTokenizer);
        release(&mut handle, DeviceAllocator::global());
    }

    // One request from release, one from the guard
    let empties = calls.events().iter().filter(|e| **e == "empty_cache").count();
    assert_eq!(empties, 2);
}
