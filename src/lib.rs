//! In-process allocation profiler core.
//!
//! Observes object birth and death events emitted by a managed runtime,
//! defers them out of the restricted hook context through a double-buffered
//! queue, and aggregates retention (live) and churn (total) statistics per
//! class and per allocation stack.

mod allocations;
mod broker;
mod call_tree;
mod capture;
mod config;
mod event;
mod queue;
mod stack;

use {
  backtrace::{Frame as NativeFrame, SymbolName},
  capture::CaptureInner,
  dashmap::DashMap,
  event::Event,
  log::{debug, warn},
  nohash_hasher::BuildNoHashHasher,
  queue::EventQueue,
  serde::Serialize,
  smallvec::SmallVec,
  std::{
    any::Any,
    collections::HashMap,
    ffi::OsStr,
    fmt::{self, Debug, Display, Formatter},
    panic::{catch_unwind, AssertUnwindSafe},
    path::Path,
    sync::{
      atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
      Arc, Mutex, MutexGuard, Weak,
    },
  },
};

pub use {
  allocations::{Allocations, AllocationsSummary},
  broker::{BrokerError, DiagnosticsSnapshot, DrainScheduler, EventBroker},
  call_tree::{CallTree, HotSpot, Metric, NodeId, PathStats},
  capture::{
    Capture, CaptureBuilder, LivenessProbe, TrackCallback, TrackOptions,
    UserState,
  },
  config::{BrokerOptions, CaptureConfig},
  event::{ClassId, EventKind, ObjectId},
  stack::{BacktraceSource, Frame, StackSource},
};

// Poisoning only matters if our own bookkeeping panicked; user-code panics
// are contained per event before they reach a lock. Recover the data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}
