/// Knobs for a capture's stack recording.
#[derive(Clone, Copy, Debug)]
pub struct CaptureConfig {
  /// Maximum frames recorded per allocation site.
  pub max_stack_depth: u16,
}

impl Default for CaptureConfig {
  fn default() -> Self {
    Self {
      max_stack_depth: 32,
    }
  }
}

impl CaptureConfig {
  #[must_use]
  pub fn with_max_stack_depth(mut self, depth: u16) -> Self {
    self.max_stack_depth = depth;
    self
  }
}

/// Knobs for the broker's ingress buffers.
#[derive(Clone, Copy, Debug, Default)]
pub struct BrokerOptions {
  /// Hard cap on events buffered per queue. `None` grows by doubling until
  /// the allocator refuses.
  pub queue_limit: Option<usize>,
}

impl BrokerOptions {
  #[must_use]
  pub fn with_queue_limit(mut self, limit: usize) -> Self {
    self.queue_limit = Some(limit);
    self
  }
}
