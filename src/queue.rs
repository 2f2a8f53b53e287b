use crate::event::Event;

const DEFAULT_CAPACITY: usize = 128;

/// Append-only buffer of event slots, filled from the allocation hook and
/// consumed during a drain.
///
/// Capacity grows by doubling; a failed or refused growth reports the push
/// as lost instead of raising, since the hook context cannot tolerate
/// either an allocation panic or re-entry.
#[derive(Debug)]
pub(crate) struct EventQueue {
  slots: Vec<Event>,
  limit: Option<usize>,
}

impl EventQueue {
  pub fn new(limit: Option<usize>) -> Self {
    Self {
      slots: Vec::new(),
      limit,
    }
  }

  /// Append one event. Returns false when the slot could not be reserved,
  /// either because the configured bound was reached or the allocator
  /// refused the doubled buffer.
  #[must_use]
  pub fn push(&mut self, event: Event) -> bool {
    if let Some(limit) = self.limit {
      if self.slots.len() >= limit {
        return false;
      }
    }

    if self.slots.len() == self.slots.capacity() && !self.grow() {
      return false;
    }

    self.slots.push(event);
    true
  }

  fn grow(&mut self) -> bool {
    let capacity = self.slots.capacity();

    let mut target = if capacity == 0 {
      DEFAULT_CAPACITY
    } else {
      match capacity.checked_mul(2) {
        Some(doubled) => doubled,
        None => return false,
      }
    };

    if let Some(limit) = self.limit {
      target = target.min(limit);
    }

    if target <= capacity {
      return false;
    }

    self
      .slots
      .try_reserve_exact(target - self.slots.len())
      .is_ok()
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  /// Move the event out of `index`, leaving a tombstone in the slot.
  ///
  /// The slot is neutralized before the caller dispatches the event, so a
  /// scan of the buffer that interleaves with user code sees no stale
  /// capture handle.
  pub fn take(&mut self, index: usize) -> Event {
    std::mem::replace(&mut self.slots[index], Event::none())
  }

  /// Reset length to zero, keeping the allocated capacity for reuse.
  pub fn clear(&mut self) {
    self.slots.clear();
  }

  #[cfg(test)]
  pub fn capacity(&self) -> usize {
    self.slots.capacity()
  }
}
