use serde::Serialize;

/// Birth and death tallies for one class within one capture.
///
/// Updated only during a drain, so the broker's single-drainer guarantee is
/// the only synchronization required.
#[derive(Clone, Copy, Debug, Default)]
pub struct Allocations {
  new_count: u64,
  free_count: u64,
}

impl Allocations {
  pub(crate) fn record_new(&mut self) {
    self.new_count += 1;
  }

  pub(crate) fn record_free(&mut self) {
    self.free_count += 1;
  }

  pub(crate) fn clear(&mut self) {
    *self = Self::default();
  }

  #[must_use]
  pub fn new_count(&self) -> u64 {
    self.new_count
  }

  #[must_use]
  pub fn free_count(&self) -> u64 {
    self.free_count
  }

  /// Live objects: births observed minus deaths observed. Deaths of objects
  /// born before tracking began are never counted, so this cannot go
  /// negative.
  #[must_use]
  pub fn retained(&self) -> u64 {
    self.new_count.saturating_sub(self.free_count)
  }

  #[must_use]
  pub fn summary(&self) -> AllocationsSummary {
    AllocationsSummary {
      new_count: self.new_count,
      free_count: self.free_count,
      retained: self.retained(),
    }
  }
}

/// Plain data view of a class's counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AllocationsSummary {
  pub new_count: u64,
  pub free_count: u64,
  pub retained: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retained_is_births_minus_deaths() {
    let mut allocations = Allocations::default();

    allocations.record_new();
    allocations.record_new();
    allocations.record_new();
    allocations.record_free();

    assert_eq!(allocations.new_count(), 3);
    assert_eq!(allocations.free_count(), 1);
    assert_eq!(allocations.retained(), 2);
  }

  #[test]
  fn clear_resets_counters() {
    let mut allocations = Allocations::default();

    allocations.record_new();
    allocations.clear();

    assert_eq!(allocations.summary(), AllocationsSummary::default());
  }

  #[test]
  fn summary_serializes_stably() {
    let mut allocations = Allocations::default();
    allocations.record_new();

    let json = serde_json::to_string(&allocations.summary()).unwrap();

    assert_eq!(json, r#"{"new_count":1,"free_count":0,"retained":1}"#);
  }
}
