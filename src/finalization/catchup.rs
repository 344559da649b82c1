//! Catch-up support: replay pacing and de-duplication of received
//! catch-up signatures.

use {
  crate::crypto::Signature,
  priority_queue::PriorityQueue,
  std::{
    cmp::Reverse,
    time::{Duration, Instant},
  },
};

/// Outcome of processing a peer's finalization summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CatchUpResult {
  /// The sender lacks state we hold; we should reply with our own
  /// summary and any records it is missing.
  pub sender_behind: bool,

  /// The summary referenced blocks we do not know; the block-level
  /// catch-up should run.
  pub block_catch_up_needed: bool,
}

/// Remembers recently seen catch-up signatures so identical
/// replays within the retention window are dropped without
/// reprocessing.
///
/// A priority queue ordered by receive time keeps eviction lazy:
/// every insert first pops whatever has fallen out of the window.
pub struct CatchUpDedup {
  seen: PriorityQueue<[u8; 64], Reverse<Instant>>,
  retention: Duration,
}

impl CatchUpDedup {
  pub fn new(retention: Duration) -> Self {
    Self {
      seen: PriorityQueue::new(),
      retention,
    }
  }

  /// Records a signature; returns false when it was already seen
  /// within the retention window.
  pub fn observe(&mut self, signature: &Signature, now: Instant) -> bool {
    while let Some((_, Reverse(at))) = self.seen.peek() {
      if now.duration_since(*at) <= self.retention {
        break;
      }
      self.seen.pop();
    }

    let key = signature.to_bytes();
    if self.seen.get(&key).is_some() {
      return false;
    }
    self.seen.push(key, Reverse(now));
    true
  }

  pub fn len(&self) -> usize {
    self.seen.len()
  }

  pub fn is_empty(&self) -> bool {
    self.seen.is_empty()
  }
}

/// Pacing for the periodic replay of the current round: the delay
/// grows with the committee size and the number of attempts already
/// made, so a large stuck committee does not flood itself.
pub fn replay_delay(
  base: Duration,
  per_party: Duration,
  parties: usize,
  attempts: u32,
) -> Duration {
  base + per_party * parties as u32 * attempts
}

#[cfg(test)]
mod tests {
  use {
    super::{replay_delay, CatchUpDedup},
    crate::crypto::Keypair,
    std::time::{Duration, Instant},
  };

  #[test]
  fn duplicate_signatures_are_dropped_within_the_window() {
    let keypair: Keypair = [17u8; 32].as_slice().try_into().unwrap();
    let signature = keypair.sign(b"summary");
    let mut dedup = CatchUpDedup::new(Duration::from_secs(60));

    let now = Instant::now();
    assert!(dedup.observe(&signature, now));
    assert!(!dedup.observe(&signature, now + Duration::from_secs(30)));
  }

  #[test]
  fn old_entries_fall_out_of_the_window() {
    let keypair: Keypair = [18u8; 32].as_slice().try_into().unwrap();
    let signature = keypair.sign(b"summary");
    let mut dedup = CatchUpDedup::new(Duration::from_secs(60));

    let now = Instant::now();
    dedup.observe(&signature, now);
    // after the retention window the same signature processes again
    assert!(dedup.observe(&signature, now + Duration::from_secs(61)));
    assert_eq!(dedup.len(), 1);
  }

  #[test]
  fn replay_delay_grows_with_attempts() {
    let base = Duration::from_millis(300);
    let per_party = Duration::from_millis(50);
    assert_eq!(replay_delay(base, per_party, 4, 0), base);
    assert_eq!(
      replay_delay(base, per_party, 4, 2),
      base + Duration::from_millis(400)
    );
  }
}
