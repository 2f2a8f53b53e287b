use super::*;

/// Arbitrary data the user associates with one live object.
pub type UserState = Box<dyn Any + Send>;

/// User callback invoked during a drain for births and deaths of tracked
/// objects.
///
/// For [`EventKind::New`] the prior state is `None` and the returned value
/// is stored with the entry; for [`EventKind::Free`] the saved state is
/// passed in and the return value is ignored. Callbacks must not block; they
/// may allocate, because processing of the resulting events is deferred.
pub type TrackCallback = Arc<
  dyn Fn(ClassId, EventKind, Option<UserState>) -> Option<UserState>
    + Send
    + Sync,
>;

/// Liveness oracle consulted by [`Capture::each_tracked`].
///
/// An object can be reclaimed while its free notification still sits in the
/// deferred queue; the probe lets iteration skip such entries.
pub trait LivenessProbe: Send + Sync {
  fn is_live(&self, object: ObjectId) -> bool;
}

struct AlwaysLive;

impl LivenessProbe for AlwaysLive {
  fn is_live(&self, _object: ObjectId) -> bool {
    true
  }
}

/// Per-class tracking configuration passed to [`Capture::track`].
#[derive(Default)]
pub struct TrackOptions {
  callback: Option<TrackCallback>,
  call_tree: bool,
}

impl TrackOptions {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn callback(
    mut self,
    callback: impl Fn(ClassId, EventKind, Option<UserState>) -> Option<UserState>
      + Send
      + Sync
      + 'static,
  ) -> Self {
    self.callback = Some(Arc::new(callback));
    self
  }

  /// Bind a call tree to the class so every birth records its allocation
  /// site.
  #[must_use]
  pub fn call_tree(mut self, enabled: bool) -> Self {
    self.call_tree = enabled;
    self
  }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Subscription {
  /// Only explicitly tracked classes.
  #[default]
  Selected,
  /// Every class, with per-class entries materialized on first event.
  All,
}

#[derive(Default)]
struct TrackedClass {
  allocations: Allocations,
  callback: Option<TrackCallback>,
  tree: Option<CallTree>,
}

struct TableEntry {
  class: ClassId,
  state: Option<UserState>,
  leaf: Option<NodeId>,
}

#[derive(Default)]
struct CaptureState {
  subscription: Subscription,
  tracked: HashMap<ClassId, TrackedClass, BuildNoHashHasher<ClassId>>,
  table: HashMap<ObjectId, TableEntry, BuildNoHashHasher<ObjectId>>,
}

/// Restores the callback gate even when user code unwinds.
struct CallbackGuard<'a>(&'a AtomicBool);

impl Drop for CallbackGuard<'_> {
  fn drop(&mut self) {
    self.0.store(true, Ordering::Release);
  }
}

pub(crate) struct CaptureInner {
  broker: EventBroker,
  running: AtomicBool,
  /// False while a user callback is on the stack. Nested events still
  /// update counters; only the nested callback is skipped, so user code
  /// that allocates cannot recurse without bound.
  enabled: AtomicBool,
  subscriber_id: Mutex<Option<u64>>,
  config: CaptureConfig,
  stack_source: Arc<dyn StackSource>,
  liveness: Arc<dyn LivenessProbe>,
  state: Mutex<CaptureState>,
}

impl CaptureInner {
  /// Hot-path filter: is this capture interested in `class` right now?
  pub(crate) fn wants(&self, class: ClassId) -> bool {
    if !self.running.load(Ordering::Acquire) {
      return false;
    }

    let state = lock(&self.state);

    match state.subscription {
      Subscription::All => true,
      Subscription::Selected => state.tracked.contains_key(&class),
    }
  }

  /// Apply one drained event. Panics from user callbacks escape to the
  /// broker, which contains and reports them per event.
  pub(crate) fn dispatch(
    &self,
    kind: EventKind,
    class: ClassId,
    object: ObjectId,
  ) {
    match kind {
      EventKind::New => self.process_new(class, object),
      EventKind::Free => self.process_free(object),
      EventKind::None => {}
    }
  }

  fn process_new(&self, class: ClassId, object: ObjectId) {
    if !self.running.load(Ordering::Acquire) {
      return;
    }

    let callback = {
      let mut state = lock(&self.state);

      if state.subscription == Subscription::Selected
        && !state.tracked.contains_key(&class)
      {
        return;
      }

      // Spurious duplicate birth; the first observation wins.
      if state.table.contains_key(&object) {
        return;
      }

      let max_depth = usize::from(self.config.max_stack_depth.max(1));
      let tracked = state.tracked.entry(class).or_default();

      tracked.allocations.record_new();

      let leaf = match &mut tracked.tree {
        Some(tree) => {
          let frames = self.stack_source.collect(max_depth);
          tree.record(&frames)
        }
        None => None,
      };

      let callback = tracked.callback.clone();

      state.table.insert(
        object,
        TableEntry {
          class,
          state: None,
          leaf,
        },
      );

      callback
    };

    let Some(callback) = callback else {
      return;
    };

    if !self.enabled.swap(false, Ordering::AcqRel) {
      return;
    }

    let gate = CallbackGuard(&self.enabled);
    let new_state = callback(class, EventKind::New, None);
    drop(gate);

    if let Some(new_state) = new_state {
      let mut state = lock(&self.state);

      // The callback may have cleared the capture; only a surviving entry
      // keeps the state.
      if let Some(entry) = state.table.get_mut(&object) {
        entry.state = Some(new_state);
      }
    }
  }

  fn process_free(&self, object: ObjectId) {
    let (class, saved_state, callback) = {
      let mut state = lock(&self.state);

      // Born before tracking started, or purged by untrack/clear.
      let Some(entry) = state.table.remove(&object) else {
        return;
      };

      let callback = match state.tracked.get_mut(&entry.class) {
        Some(tracked) => {
          tracked.allocations.record_free();

          if let (Some(tree), Some(leaf)) = (&mut tracked.tree, entry.leaf) {
            tree.decrement_path(leaf);
          }

          tracked.callback.clone()
        }
        None => None,
      };

      (entry.class, entry.state, callback)
    };

    let Some(callback) = callback else {
      return;
    };

    if !self.enabled.swap(false, Ordering::AcqRel) {
      return;
    }

    let gate = CallbackGuard(&self.enabled);
    let _ = callback(class, EventKind::Free, saved_state);
    drop(gate);
  }
}

/// Configures a [`Capture`] before construction.
pub struct CaptureBuilder {
  broker: EventBroker,
  config: CaptureConfig,
  stack_source: Arc<dyn StackSource>,
  liveness: Arc<dyn LivenessProbe>,
}

impl CaptureBuilder {
  #[must_use]
  pub fn new(broker: &EventBroker) -> Self {
    Self {
      broker: broker.clone(),
      config: CaptureConfig::default(),
      stack_source: Arc::new(BacktraceSource::default()),
      liveness: Arc::new(AlwaysLive),
    }
  }

  #[must_use]
  pub fn config(mut self, config: CaptureConfig) -> Self {
    self.config = config;
    self
  }

  #[must_use]
  pub fn max_stack_depth(mut self, depth: u16) -> Self {
    self.config.max_stack_depth = depth;
    self
  }

  #[must_use]
  pub fn stack_source(mut self, source: Arc<dyn StackSource>) -> Self {
    self.stack_source = source;
    self
  }

  #[must_use]
  pub fn liveness_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
    self.liveness = probe;
    self
  }

  #[must_use]
  pub fn finish(self) -> Capture {
    Capture {
      inner: Arc::new(CaptureInner {
        broker: self.broker,
        running: AtomicBool::new(false),
        enabled: AtomicBool::new(true),
        subscriber_id: Mutex::new(None),
        config: self.config,
        stack_source: self.stack_source,
        liveness: self.liveness,
        state: Mutex::new(CaptureState::default()),
      }),
    }
  }
}

/// Observes births and deaths of tracked classes through one broker.
///
/// Captures are independent: each running capture sees every event for its
/// subscribed classes with its own tables and counters. All bookkeeping
/// happens during a drain; the hot path only filters and enqueues.
#[derive(Clone)]
pub struct Capture {
  inner: Arc<CaptureInner>,
}

impl Debug for Capture {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    let state = lock(&self.inner.state);

    f.debug_struct("Capture")
      .field("running", &self.inner.running.load(Ordering::Relaxed))
      .field("tracked_classes", &state.tracked.len())
      .field("live_objects", &state.table.len())
      .finish_non_exhaustive()
  }
}

impl Capture {
  #[must_use]
  pub fn new(broker: &EventBroker) -> Self {
    CaptureBuilder::new(broker).finish()
  }

  #[must_use]
  pub fn builder(broker: &EventBroker) -> CaptureBuilder {
    CaptureBuilder::new(broker)
  }

  /// Begin observing events for the subscribed classes.
  ///
  /// Returns false if already running.
  pub fn start(&self) -> bool {
    if self.inner.running.swap(true, Ordering::AcqRel) {
      return false;
    }

    let id = self.inner.broker.subscribe(Arc::downgrade(&self.inner));
    *lock(&self.inner.subscriber_id) = Some(id);

    debug!("capture started");

    true
  }

  /// Stop observing.
  ///
  /// Drains everything already enqueued first, so counters reflect every
  /// pending birth and death, then unsubscribes. Returns false if not
  /// running.
  ///
  /// # Panics
  ///
  /// Panics when called from inside a user callback (see
  /// [`EventBroker::process_all`]).
  pub fn stop(&self) -> bool {
    if !self.inner.running.load(Ordering::Acquire) {
      return false;
    }

    self.inner.broker.process_all();

    if let Some(id) = lock(&self.inner.subscriber_id).take() {
      self.inner.broker.unsubscribe(id);
    }

    self.inner.running.store(false, Ordering::Release);

    debug!("capture stopped");

    true
  }

  #[must_use]
  pub fn running(&self) -> bool {
    self.inner.running.load(Ordering::Acquire)
  }

  /// Subscribe to births and deaths of `class`.
  ///
  /// Re-tracking an already tracked class swaps the callback and call-tree
  /// binding atomically while keeping its counters. A class that was
  /// untracked in between starts from zero again.
  pub fn track(&self, class: ClassId, options: TrackOptions) {
    let mut state = lock(&self.inner.state);
    let entry = state.tracked.entry(class).or_default();

    entry.callback = options.callback;

    let drop_tree = !options.call_tree && entry.tree.is_some();

    if options.call_tree && entry.tree.is_none() {
      entry.tree = Some(CallTree::new());
    } else if drop_tree {
      entry.tree = None;
    }

    if drop_tree {
      // Handles into the dropped tree die with it.
      for table_entry in state.table.values_mut() {
        if table_entry.class == class {
          table_entry.leaf = None;
        }
      }
    }
  }

  /// Observe every class. Explicitly tracked classes keep their callbacks
  /// and call trees; others materialize bare counters on first event.
  pub fn track_all(&self) {
    lock(&self.inner.state).subscription = Subscription::All;
  }

  /// Return to explicit subscriptions, dropping every class and its
  /// entries.
  pub fn untrack_all(&self) {
    let mut state = lock(&self.inner.state);
    state.subscription = Subscription::Selected;
    state.tracked.clear();
    state.table.clear();
  }

  /// Drop `class`: subscription, counters, call tree, and live entries.
  /// Unknown classes are a no-op.
  pub fn untrack(&self, class: ClassId) {
    let mut state = lock(&self.inner.state);

    if state.tracked.remove(&class).is_none() {
      return;
    }

    state.table.retain(|_, entry| entry.class != class);
  }

  #[must_use]
  pub fn tracking(&self, class: ClassId) -> bool {
    let state = lock(&self.inner.state);

    match state.subscription {
      Subscription::All => true,
      Subscription::Selected => state.tracked.contains_key(&class),
    }
  }

  /// Live objects of `class`: births observed minus deaths observed. Zero
  /// for untracked classes.
  #[must_use]
  pub fn count_for(&self, class: ClassId) -> u64 {
    lock(&self.inner.state)
      .tracked
      .get(&class)
      .map_or(0, |entry| entry.allocations.retained())
  }

  #[must_use]
  pub fn allocations_for(&self, class: ClassId) -> AllocationsSummary {
    lock(&self.inner.state)
      .tracked
      .get(&class)
      .map_or_else(AllocationsSummary::default, |entry| {
        entry.allocations.summary()
      })
  }

  /// Reset all counters, live entries, and call-tree contents.
  /// Subscriptions, callbacks, and tree bindings survive; safe while
  /// running.
  pub fn clear(&self) {
    let mut state = lock(&self.inner.state);

    for entry in state.tracked.values_mut() {
      entry.allocations.clear();

      if let Some(tree) = &mut entry.tree {
        tree.clear();
      }
    }

    state.table.clear();
  }

  /// Visit each live tracked entry of `class`.
  ///
  /// Entries whose object has already died but whose free notification has
  /// not yet drained are skipped via the liveness probe. The visitor runs
  /// under the capture's lock and must not call back into the capture or
  /// the broker.
  pub fn each_tracked(
    &self,
    class: ClassId,
    mut visitor: impl FnMut(ObjectId, Option<&UserState>),
  ) {
    let state = lock(&self.inner.state);

    for (object, entry) in &state.table {
      if entry.class != class {
        continue;
      }

      if !self.inner.liveness.is_live(*object) {
        continue;
      }

      visitor(*object, entry.state.as_ref());
    }
  }

  /// Run `query` against the call tree bound to `class`, if any.
  pub fn with_call_tree<R>(
    &self,
    class: ClassId,
    query: impl FnOnce(&CallTree) -> R,
  ) -> Option<R> {
    let state = lock(&self.inner.state);
    let tree = state.tracked.get(&class)?.tree.as_ref()?;

    Some(query(tree))
  }

  /// Heaviest allocation paths for `class`, if a call tree is bound.
  #[must_use]
  pub fn top_paths(
    &self,
    class: ClassId,
    limit: usize,
    by: Metric,
  ) -> Option<Vec<PathStats>> {
    self.with_call_tree(class, |tree| tree.top_paths(limit, by))
  }

  /// Heaviest source locations for `class`, if a call tree is bound.
  #[must_use]
  pub fn hotspots(
    &self,
    class: ClassId,
    limit: usize,
    by: Metric,
  ) -> Option<Vec<HotSpot>> {
    self.with_call_tree(class, |tree| tree.hotspots(limit, by))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::{HashSet, VecDeque};

  struct ManualScheduler;

  impl DrainScheduler for ManualScheduler {
    fn register(&self) -> bool {
      true
    }

    fn request_drain(&self) {}
  }

  fn broker() -> EventBroker {
    EventBroker::new(Arc::new(ManualScheduler)).unwrap()
  }

  /// Simulates the host's safe point until no deferred work remains.
  fn pump(broker: &EventBroker) {
    while broker.pending() > 0 {
      broker.drain();
    }
  }

  const H: ClassId = ClassId::new(1);
  const A: ClassId = ClassId::new(2);

  #[derive(Default)]
  struct ScriptedStacks {
    stacks: Mutex<VecDeque<Vec<Frame>>>,
  }

  impl ScriptedStacks {
    fn queue(stacks: Vec<Vec<Frame>>) -> Arc<Self> {
      Arc::new(Self {
        stacks: Mutex::new(stacks.into()),
      })
    }
  }

  impl StackSource for ScriptedStacks {
    fn collect(&self, max_depth: usize) -> Vec<Frame> {
      let mut frames = lock(&self.stacks).pop_front().unwrap_or_default();
      frames.truncate(max_depth);
      frames
    }
  }

  struct SetProbe {
    dead: Mutex<HashSet<u64>>,
  }

  impl LivenessProbe for SetProbe {
    fn is_live(&self, object: ObjectId) -> bool {
      !lock(&self.dead).contains(&object.raw())
    }
  }

  fn frame(label: &str) -> Frame {
    Frame::new("app/main.rb", label, 1)
  }

  #[test]
  fn start_and_stop_report_state_transitions() {
    let broker = broker();
    let capture = Capture::new(&broker);

    assert!(!capture.running());
    assert!(capture.start());
    assert!(!capture.start());
    assert!(capture.running());
    assert!(capture.stop());
    assert!(!capture.stop());
    assert!(!capture.running());
  }

  #[test]
  fn births_and_deaths_update_counters() {
    let broker = broker();
    let capture = Capture::new(&broker);
    capture.track(H, TrackOptions::default());
    assert!(capture.start());

    for id in 1..=5 {
      broker.record_allocation(H, ObjectId::new(id));
    }
    broker.record_free(H, ObjectId::new(1));
    broker.drain();

    assert_eq!(capture.count_for(H), 4);

    let summary = capture.allocations_for(H);
    assert_eq!(summary.new_count, 5);
    assert_eq!(summary.free_count, 1);
    assert_eq!(summary.retained, 4);
  }

  #[test]
  fn disjoint_captures_do_not_share_counters() {
    let broker = broker();

    let first = Capture::new(&broker);
    first.track(H, TrackOptions::default());
    assert!(first.start());

    let second = Capture::new(&broker);
    second.track(A, TrackOptions::default());
    assert!(second.start());

    for id in 1..=5 {
      broker.record_allocation(H, ObjectId::new(id));
    }
    for id in 6..=8 {
      broker.record_allocation(A, ObjectId::new(id));
    }
    broker.drain();

    assert_eq!(first.count_for(H), 5);
    assert_eq!(first.count_for(A), 0);
    assert_eq!(second.count_for(A), 3);
    assert_eq!(second.count_for(H), 0);
  }

  #[test]
  fn events_for_the_same_identity_stay_ordered() {
    let broker = broker();
    let capture = Capture::new(&broker);
    capture.track(H, TrackOptions::default());
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.record_free(H, ObjectId::new(1));
    broker.record_allocation(H, ObjectId::new(1));
    broker.drain();

    let summary = capture.allocations_for(H);
    assert_eq!(summary.new_count, 2);
    assert_eq!(summary.free_count, 1);
    assert_eq!(capture.count_for(H), 1);
  }

  #[test]
  fn deaths_of_objects_born_before_tracking_are_ignored() {
    let broker = broker();
    let capture = Capture::new(&broker);
    capture.track(H, TrackOptions::default());
    assert!(capture.start());

    for id in 1..=100 {
      broker.record_free(H, ObjectId::new(id));
    }
    broker.drain();

    assert_eq!(capture.count_for(H), 0);
    assert_eq!(capture.allocations_for(H).free_count, 0);
  }

  #[test]
  fn duplicate_births_are_ignored_after_the_first() {
    let broker = broker();
    let capture = Capture::new(&broker);
    capture.track(H, TrackOptions::default());
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.record_allocation(H, ObjectId::new(1));
    broker.drain();

    assert_eq!(capture.allocations_for(H).new_count, 1);
  }

  #[test]
  fn untrack_purges_counters_and_live_entries() {
    let broker = broker();
    let capture = Capture::new(&broker);
    capture.track(H, TrackOptions::default());
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.drain();

    // The free is enqueued while tracked but drains after the untrack.
    broker.record_free(H, ObjectId::new(1));
    capture.untrack(H);
    broker.drain();

    assert!(!capture.tracking(H));
    assert_eq!(capture.count_for(H), 0);
    assert_eq!(capture.allocations_for(H), AllocationsSummary::default());

    capture.untrack(H);
  }

  #[test]
  fn clear_keeps_subscription_and_keeps_running() {
    let broker = broker();
    let capture = Capture::new(&broker);
    capture.track(H, TrackOptions::default());
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.drain();
    capture.clear();

    assert!(capture.running());
    assert!(capture.tracking(H));
    assert_eq!(capture.count_for(H), 0);

    broker.record_allocation(H, ObjectId::new(2));
    broker.drain();

    assert_eq!(capture.count_for(H), 1);
  }

  #[test]
  fn stop_drains_pending_events_first() {
    let broker = broker();
    let capture = Capture::new(&broker);
    capture.track(H, TrackOptions::default());
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.record_allocation(H, ObjectId::new(2));

    assert!(capture.stop());

    assert_eq!(capture.count_for(H), 2);
    assert_eq!(broker.pending(), 0);
  }

  #[test]
  fn restarting_accumulates_counters() {
    let broker = broker();
    let capture = Capture::new(&broker);
    capture.track(H, TrackOptions::default());

    assert!(capture.start());
    broker.record_allocation(H, ObjectId::new(1));
    assert!(capture.stop());

    assert!(capture.start());
    broker.record_allocation(H, ObjectId::new(2));
    broker.drain();

    assert_eq!(capture.allocations_for(H).new_count, 2);
  }

  #[test]
  fn retracking_replaces_the_callback_and_keeps_counters() {
    let broker = broker();
    let capture = Capture::new(&broker);

    let first_calls = Arc::new(AtomicU64::new(0));
    let second_calls = Arc::new(AtomicU64::new(0));

    let calls = first_calls.clone();
    capture.track(
      H,
      TrackOptions::new().callback(move |_, _, _| {
        calls.fetch_add(1, Ordering::Relaxed);
        None
      }),
    );
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.drain();

    let calls = second_calls.clone();
    capture.track(
      H,
      TrackOptions::new().callback(move |_, _, _| {
        calls.fetch_add(1, Ordering::Relaxed);
        None
      }),
    );

    broker.record_allocation(H, ObjectId::new(2));
    broker.drain();

    assert_eq!(first_calls.load(Ordering::Relaxed), 1);
    assert_eq!(second_calls.load(Ordering::Relaxed), 1);
    assert_eq!(capture.allocations_for(H).new_count, 2);
  }

  #[test]
  fn callback_state_travels_from_birth_to_death() {
    let broker = broker();
    let capture = Capture::new(&broker);

    let freed_state = Arc::new(AtomicU64::new(0));
    let freed = freed_state.clone();

    capture.track(
      H,
      TrackOptions::new().callback(move |_, kind, state| match kind {
        EventKind::New => Some(Box::new(42_u64) as UserState),
        EventKind::Free => {
          if let Some(value) =
            state.as_ref().and_then(|state| state.downcast_ref::<u64>())
          {
            freed.store(*value, Ordering::Relaxed);
          }
          None
        }
        EventKind::None => None,
      }),
    );
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.drain();

    let mut seen = Vec::new();
    capture.each_tracked(H, |object, state| {
      seen.push((
        object.raw(),
        state.and_then(|state| state.downcast_ref::<u64>()).copied(),
      ));
    });
    assert_eq!(seen, vec![(1, Some(42))]);

    broker.record_free(H, ObjectId::new(1));
    broker.drain();

    assert_eq!(freed_state.load(Ordering::Relaxed), 42);
  }

  #[test]
  fn panicking_callback_is_contained_and_reported() {
    let broker = broker();
    let capture = Capture::new(&broker);

    let panicked = Arc::new(AtomicBool::new(false));
    let armed = panicked.clone();

    capture.track(
      H,
      TrackOptions::new().callback(move |_, _, _| {
        if !armed.swap(true, Ordering::Relaxed) {
          panic!("user callback exploded");
        }
        None
      }),
    );
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.record_allocation(H, ObjectId::new(2));
    broker.drain();

    assert_eq!(broker.diagnostics().callback_errors, 1);
    assert_eq!(capture.allocations_for(H).new_count, 2);
  }

  #[test]
  fn allocating_callback_converges_without_recursion() {
    let broker = broker();
    let capture = Capture::new(&broker);

    let spawned = Arc::new(AtomicU64::new(0));
    let next_id = Arc::new(AtomicU64::new(100));
    let hook = broker.clone();
    let spawn_counter = spawned.clone();

    capture.track(
      H,
      TrackOptions::new().callback(move |_, kind, _| {
        if kind == EventKind::New
          && spawn_counter.load(Ordering::Relaxed) < 5
        {
          spawn_counter.fetch_add(1, Ordering::Relaxed);
          hook.record_allocation(
            H,
            ObjectId::new(next_id.fetch_add(1, Ordering::Relaxed)),
          );
        }
        None
      }),
    );
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    pump(&broker);

    assert_eq!(spawned.load(Ordering::Relaxed), 5);
    assert_eq!(capture.allocations_for(H).new_count, 6);
  }

  #[test]
  fn callback_gate_skips_nested_invocations_but_still_counts() {
    let broker = broker();
    let capture = Capture::new(&broker);

    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();

    capture.track(
      H,
      TrackOptions::new().callback(move |_, _, _| {
        counter.fetch_add(1, Ordering::Relaxed);
        None
      }),
    );
    assert!(capture.start());

    capture.inner.enabled.store(false, Ordering::Release);
    broker.record_allocation(H, ObjectId::new(1));
    broker.drain();

    assert_eq!(calls.load(Ordering::Relaxed), 0);
    assert_eq!(capture.allocations_for(H).new_count, 1);

    capture.inner.enabled.store(true, Ordering::Release);
    broker.record_allocation(H, ObjectId::new(2));
    broker.drain();

    assert_eq!(calls.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn stopping_from_a_callback_fails_loudly_but_is_contained() {
    let broker = broker();
    let capture = Capture::new(&broker);

    let handle = Capture::clone(&capture);
    capture.track(
      H,
      TrackOptions::new().callback(move |_, _, _| {
        handle.stop();
        None
      }),
    );
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.drain();

    assert_eq!(broker.diagnostics().callback_errors, 1);
    assert!(capture.running());
  }

  #[test]
  fn each_tracked_skips_objects_already_reclaimed() {
    let broker = broker();
    let probe = Arc::new(SetProbe {
      dead: Mutex::new(HashSet::new()),
    });
    let capture = Capture::builder(&broker)
      .liveness_probe(probe.clone())
      .finish();
    capture.track(H, TrackOptions::default());
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.record_allocation(H, ObjectId::new(2));
    broker.drain();

    // Object 2 dies; its free notification has not drained yet.
    lock(&probe.dead).insert(2);

    let mut seen = Vec::new();
    capture.each_tracked(H, |object, _| seen.push(object.raw()));

    assert_eq!(seen, vec![1]);
  }

  #[test]
  fn track_all_observes_every_class() {
    let broker = broker();
    let capture = Capture::new(&broker);
    capture.track_all();
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.record_allocation(A, ObjectId::new(2));
    broker.drain();

    assert!(capture.tracking(ClassId::new(99)));
    assert_eq!(capture.count_for(H), 1);
    assert_eq!(capture.count_for(A), 1);

    capture.untrack_all();

    assert!(!capture.tracking(H));
    assert_eq!(capture.count_for(H), 0);
  }

  #[test]
  fn call_tree_attributes_births_and_deaths_to_sites() {
    let broker = broker();

    let mut stacks = Vec::new();
    for _ in 0..2 {
      stacks.push(vec![frame("outer"), frame("make_h")]);
    }
    stacks.push(vec![frame("outer"), frame("make_other")]);

    let capture = Capture::builder(&broker)
      .stack_source(ScriptedStacks::queue(stacks))
      .finish();
    capture.track(H, TrackOptions::new().call_tree(true));
    assert!(capture.start());

    for id in 1..=3 {
      broker.record_allocation(H, ObjectId::new(id));
    }
    broker.drain();

    let totals = capture
      .with_call_tree(H, |tree| {
        (tree.total_allocations(), tree.retained_allocations())
      })
      .unwrap();
    assert_eq!(totals, (3, 3));

    broker.record_free(H, ObjectId::new(1));
    broker.drain();

    let spots = capture.hotspots(H, 10, Metric::Total).unwrap();
    let outer = spots
      .iter()
      .find(|spot| spot.location == frame("outer").location_key())
      .unwrap();
    assert_eq!((outer.total, outer.retained), (3, 2));

    let paths = capture.top_paths(H, 10, Metric::Retained).unwrap();
    assert_eq!(paths.len(), 2);

    // Retained across classes matches the live table.
    let mut live = 0_u64;
    capture.each_tracked(H, |_, _| live += 1);
    assert_eq!(live, capture.count_for(H));
  }

  #[test]
  fn disabling_the_call_tree_clears_stale_leaf_handles() {
    let broker = broker();
    let capture = Capture::builder(&broker)
      .stack_source(ScriptedStacks::queue(vec![vec![frame("site")]]))
      .finish();
    capture.track(H, TrackOptions::new().call_tree(true));
    assert!(capture.start());

    broker.record_allocation(H, ObjectId::new(1));
    broker.drain();

    capture.track(H, TrackOptions::new());
    assert!(capture.with_call_tree(H, |_| ()).is_none());

    broker.record_free(H, ObjectId::new(1));
    broker.drain();

    assert_eq!(capture.allocations_for(H).free_count, 1);
  }
}
