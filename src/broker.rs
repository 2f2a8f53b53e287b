use super::*;

/// Deferred-work contract with the host runtime.
///
/// The runtime offers exactly one deferred-work slot, so one scheduler
/// serves one broker for the life of the process.
pub trait DrainScheduler: Send + Sync {
  /// Reserve the runtime's deferred-work slot. Invoked once while the
  /// broker is constructed; refusing is fatal.
  fn register(&self) -> bool;

  /// Ask the runtime to invoke [`EventBroker::drain`] at its next safe
  /// point. Called from hook context, so it must not allocate on the
  /// managed heap or re-enter the profiler. Invoking `drain` synchronously
  /// is tolerated; the re-entrant call is coalesced.
  fn request_drain(&self);
}

/// Errors from broker initialization.
#[derive(Debug)]
pub enum BrokerError {
  /// The host runtime refused to hand over its deferred-work slot.
  DeferredWorkUnavailable,
}

impl Display for BrokerError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::DeferredWorkUnavailable => {
        write!(f, "failed to reserve the runtime's deferred-work slot")
      }
    }
  }
}

impl std::error::Error for BrokerError {}

/// Counters describing work the broker could not deliver normally.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
  /// Events discarded because a buffer could not grow.
  pub dropped_events: u64,
  /// User callbacks that panicked during a drain.
  pub callback_errors: u64,
}

struct BrokerInner {
  /// Double-buffered slot queues. `available` indexes the one receiving
  /// events; the other is drained.
  queues: [Mutex<EventQueue>; 2],
  available: AtomicUsize,
  draining: AtomicBool,
  scheduler: Arc<dyn DrainScheduler>,
  subscribers: DashMap<u64, Weak<CaptureInner>, BuildNoHashHasher<u64>>,
  next_subscriber_id: AtomicU64,
  dropped_events: AtomicU64,
  callback_errors: AtomicU64,
}

/// Single ingress for allocation and free notifications.
///
/// The hot path appends to the available buffer and requests deferred work;
/// when the runtime grants a safe context, [`drain`](Self::drain) swaps the
/// buffers and delivers the snapshot to each event's capture. User code runs
/// only inside a drain, never inside the hook.
///
/// One broker is constructed at process initialization and handed by
/// reference to every capture; it is `Clone` in the shared-handle sense.
#[derive(Clone)]
pub struct EventBroker {
  inner: Arc<BrokerInner>,
}

impl Debug for EventBroker {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventBroker")
      .field("pending", &self.pending())
      .field(
        "draining",
        &self.inner.draining.load(Ordering::Relaxed),
      )
      .finish_non_exhaustive()
  }
}

impl EventBroker {
  /// Construct with default options.
  ///
  /// # Errors
  ///
  /// Returns [`BrokerError::DeferredWorkUnavailable`] when the scheduler
  /// refuses to reserve the runtime's deferred-work slot.
  pub fn new(scheduler: Arc<dyn DrainScheduler>) -> Result<Self, BrokerError> {
    Self::with_options(scheduler, BrokerOptions::default())
  }

  /// # Errors
  ///
  /// Returns [`BrokerError::DeferredWorkUnavailable`] when the scheduler
  /// refuses to reserve the runtime's deferred-work slot.
  pub fn with_options(
    scheduler: Arc<dyn DrainScheduler>,
    options: BrokerOptions,
  ) -> Result<Self, BrokerError> {
    if !scheduler.register() {
      return Err(BrokerError::DeferredWorkUnavailable);
    }

    let inner = BrokerInner {
      queues: [
        Mutex::new(EventQueue::new(options.queue_limit)),
        Mutex::new(EventQueue::new(options.queue_limit)),
      ],
      available: AtomicUsize::new(0),
      draining: AtomicBool::new(false),
      scheduler,
      subscribers: DashMap::with_hasher(BuildNoHashHasher::default()),
      next_subscriber_id: AtomicU64::new(1),
      dropped_events: AtomicU64::new(0),
      callback_errors: AtomicU64::new(0),
    };

    Ok(Self {
      inner: Arc::new(inner),
    })
  }

  /// Hot-path hook: an object of `class` was born.
  pub fn record_allocation(&self, class: ClassId, object: ObjectId) {
    self.enqueue(EventKind::New, class, object);
  }

  /// Hot-path hook: an object's storage was reclaimed, possibly
  /// mid-collection.
  pub fn record_free(&self, class: ClassId, object: ObjectId) {
    self.enqueue(EventKind::Free, class, object);
  }

  fn enqueue(&self, kind: EventKind, class: ClassId, object: ObjectId) {
    let inner = &self.inner;
    let mut pushed = false;
    let mut dead: SmallVec<[u64; 4]> = SmallVec::new();

    for entry in inner.subscribers.iter() {
      let Some(capture) = entry.value().upgrade() else {
        dead.push(*entry.key());
        continue;
      };

      if !capture.wants(class) {
        continue;
      }

      let event = Event {
        kind,
        capture: entry.value().clone(),
        class,
        object,
      };

      let index = inner.available.load(Ordering::Acquire);

      if lock(&inner.queues[index]).push(event) {
        pushed = true;
      } else {
        inner.dropped_events.fetch_add(1, Ordering::Relaxed);
        debug!(
          "event buffer full, dropping {kind:?} for object {}",
          object.raw()
        );
      }
    }

    for id in dead {
      inner.subscribers.remove(&id);
    }

    if pushed {
      inner.scheduler.request_drain();
    }
  }

  /// Process the snapshot of events taken at entry.
  ///
  /// Invoked by the host at a safe point. A re-entrant call (the scheduler
  /// running synchronously, or an allocation inside a user callback
  /// re-triggering deferred work) returns immediately; the outer drain
  /// observes anything enqueued meanwhile because the available buffer keeps
  /// receiving.
  pub fn drain(&self) {
    if self
      .inner
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return;
    }

    self.drain_snapshot();

    self.inner.draining.store(false, Ordering::Release);
  }

  /// Flush everything pending right now.
  ///
  /// Used by [`Capture::stop`](crate::Capture::stop) so counters reflect
  /// every enqueued birth and death before the capture unsubscribes.
  ///
  /// # Panics
  ///
  /// Panics when called from inside a drain (that is, from a user
  /// callback), which would corrupt the double buffering.
  pub fn process_all(&self) {
    assert!(
      !self.inner.draining.load(Ordering::Acquire),
      "process_all called recursively from a drain callback"
    );

    self.drain();
  }

  fn drain_snapshot(&self) {
    let inner = &self.inner;

    // Swap the buffers: new events keep flowing into the other one with no
    // pause while this snapshot is dispatched.
    let processing = inner.available.load(Ordering::Acquire);
    inner.available.store(1 - processing, Ordering::Release);

    let mut queue = lock(&inner.queues[processing]);

    for index in 0..queue.len() {
      // Taking the event tombstones the slot before any user code runs.
      let event = queue.take(index);

      let Some(capture) = event.capture.upgrade() else {
        continue;
      };

      if event.kind == EventKind::None {
        continue;
      }

      let outcome = catch_unwind(AssertUnwindSafe(|| {
        capture.dispatch(event.kind, event.class, event.object);
      }));

      if let Err(payload) = outcome {
        inner.callback_errors.fetch_add(1, Ordering::Relaxed);
        warn!(
          "user callback panicked during drain (suppressed): {}",
          panic_message(payload.as_ref())
        );
      }
    }

    queue.clear();
  }

  /// Events waiting in the receiving buffer.
  #[must_use]
  pub fn pending(&self) -> usize {
    let index = self.inner.available.load(Ordering::Acquire);
    lock(&self.inner.queues[index]).len()
  }

  #[must_use]
  pub fn diagnostics(&self) -> DiagnosticsSnapshot {
    DiagnosticsSnapshot {
      dropped_events: self.inner.dropped_events.load(Ordering::Relaxed),
      callback_errors: self.inner.callback_errors.load(Ordering::Relaxed),
    }
  }

  pub(crate) fn subscribe(&self, capture: Weak<CaptureInner>) -> u64 {
    let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
    self.inner.subscribers.insert(id, capture);
    id
  }

  pub(crate) fn unsubscribe(&self, id: u64) {
    self.inner.subscribers.remove(&id);
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    message
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message
  } else {
    "non-string panic payload"
  }
}
