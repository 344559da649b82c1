//! Outbound delay buffer for CSS `Seen` messages.
//!
//! `Seen` traffic is the chattiest part of a round and is almost
//! always subsumed by the sender's eventual `DoneReporting`.
//! Instead of broadcasting each one immediately, the newest `Seen`
//! per `(index, delta, phase)` sits here for up to a second, and at
//! most ten seconds from the first buffering. A `DoneReporting` for
//! the same key flushes the buffered `Seen` unconditionally so it
//! is never reordered after it.

use {
  super::messages::{Delta, FinalizationIndex, Phase, WmvbaMessage},
  std::{
    collections::HashMap,
    time::{Duration, Instant},
  },
};

const DELAY_STEP: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(10);

pub type BufferKey = (FinalizationIndex, Delta, Phase);

struct BufferedSeen {
  message: WmvbaMessage,
  first_buffered: Instant,
  deadline: Instant,
}

#[derive(Default)]
pub struct SeenBuffer {
  entries: HashMap<BufferKey, BufferedSeen>,
}

impl SeenBuffer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Buffers a `Seen` message, superseding any older one for the
  /// same key.
  pub fn buffer_seen(
    &mut self,
    key: BufferKey,
    message: WmvbaMessage,
    now: Instant,
  ) {
    match self.entries.get_mut(&key) {
      Some(entry) => {
        entry.message = message;
        entry.deadline =
          (now + DELAY_STEP).min(entry.first_buffered + MAX_DELAY);
      }
      None => {
        self.entries.insert(key, BufferedSeen {
          message,
          first_buffered: now,
          deadline: now + DELAY_STEP,
        });
      }
    }
  }

  /// Unconditionally releases the buffered `Seen` for a key; called
  /// when a `DoneReporting` with the same key is about to go out.
  pub fn flush(&mut self, key: &BufferKey) -> Option<WmvbaMessage> {
    self.entries.remove(key).map(|entry| entry.message)
  }

  /// Releases every message whose deadline has passed.
  pub fn take_due(&mut self, now: Instant) -> Vec<(BufferKey, WmvbaMessage)> {
    let due: Vec<BufferKey> = self
      .entries
      .iter()
      .filter(|(_, entry)| entry.deadline <= now)
      .map(|(key, _)| *key)
      .collect();
    due
      .into_iter()
      .filter_map(|key| self.flush(&key).map(|message| (key, message)))
      .collect()
  }

  /// Drops buffered messages for indices that are no longer
  /// current.
  pub fn drop_below_index(&mut self, index: FinalizationIndex) {
    self.entries.retain(|(i, _, _), _| *i >= index);
  }

  pub fn next_deadline(&self) -> Option<Instant> {
    self.entries.values().map(|entry| entry.deadline).min()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
