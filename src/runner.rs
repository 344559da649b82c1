//! The concurrency envelope around [`SkovState`].
//!
//! One mutex serializes every mutation; the ingress consumer, the
//! baker, the transaction purger and the finalization replay timer
//! all take it in turn. Outbound callbacks never run with the lock
//! held: each critical section drains the event queue into a local
//! vector first and dispatches after release, which also preserves
//! the protocol's output ordering.

use {
  crate::{
    baker::{try_bake, BakeOutcome, BakerIdentity},
    crypto::BlockHash,
    skov::{SkovEvent, SkovState, Tick, UpdateResult},
  },
  anyhow::Result,
  chrono::{DateTime, Utc},
  crossbeam_channel::{bounded, Receiver, Sender},
  parking_lot::{Condvar, Mutex},
  std::{
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
  },
  tracing::{debug, info},
};

/// Everything a peer or client can feed into the node, already
/// serialized. `Shutdown` drains the consumer thread.
#[derive(Debug)]
pub enum InboundMessage {
  Block(Vec<u8>),
  Transaction(Vec<u8>),
  FinalizationMessage(Vec<u8>),
  FinalizationRecord(Vec<u8>),
  CatchUpStatus(Vec<u8>),
  Shutdown,
}

/// Outbound side of the node. Implementations must be thread-safe
/// and tolerate duplicate deliveries.
pub trait OutboundSink: Send + Sync {
  fn broadcast_block(&self, bytes: &[u8]);
  fn broadcast_finalization_message(&self, bytes: &[u8]);
  fn broadcast_finalization_record(&self, bytes: &[u8]);
  fn broadcast_catch_up(&self, bytes: &[u8]);
  fn send_direct_block(&self, to: u32, bytes: &[u8]);
  fn send_direct_finalization_record(&self, to: u32, bytes: &[u8]);
  fn notify_finalized(&self, block: BlockHash, height: u64, index: u64);

  /// A scheduled chain-parameter update took effect; the embedding
  /// node restarts consensus from the new parameters.
  fn notify_protocol_update(&self, payload: &[u8]);
}

struct TimerInner {
  cancelled: AtomicBool,
  lock: Mutex<()>,
  wakeup: Condvar,
}

/// Handle to a scheduled callback. Cancellation is idempotent and
/// never waits for an in-flight callback; cancelling after the
/// timer fired is a no-op.
#[derive(Clone)]
pub struct TimerHandle {
  inner: Arc<TimerInner>,
}

impl TimerHandle {
  pub fn cancel(&self) {
    self.inner.cancelled.store(true, Ordering::SeqCst);
    self.inner.wakeup.notify_all();
  }
}

/// Thread-per-timer scheduling: each timer sleeps on a condvar
/// until its deadline or cancellation.
#[derive(Default)]
pub struct TimerService {
  timers: Mutex<Vec<TimerHandle>>,
}

impl TimerService {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn schedule(
    &self,
    deadline: Instant,
    callback: impl FnOnce() + Send + 'static,
  ) -> TimerHandle {
    let inner = Arc::new(TimerInner {
      cancelled: AtomicBool::new(false),
      lock: Mutex::new(()),
      wakeup: Condvar::new(),
    });
    let handle = TimerHandle {
      inner: Arc::clone(&inner),
    };

    thread::spawn(move || {
      let mut guard = inner.lock.lock();
      while !inner.cancelled.load(Ordering::SeqCst) {
        if Instant::now() >= deadline {
          break;
        }
        inner.wakeup.wait_until(&mut guard, deadline);
      }
      drop(guard);
      if !inner.cancelled.load(Ordering::SeqCst) {
        callback();
      }
    });

    self.timers.lock().push(handle.clone());
    handle
  }

  pub fn cancel_all(&self) {
    for timer in self.timers.lock().drain(..) {
      timer.cancel();
    }
  }
}

/// The running node: state lock, ingress channel and background
/// threads.
pub struct Runner {
  state: Arc<Mutex<SkovState>>,
  sink: Arc<dyn OutboundSink>,
  ingress: Sender<InboundMessage>,
  shutdown: Arc<AtomicBool>,
  timers: Arc<TimerService>,
  threads: Vec<JoinHandle<()>>,
}

impl Runner {
  pub fn start(
    state: SkovState,
    sink: Arc<dyn OutboundSink>,
    baker: Option<BakerIdentity>,
  ) -> Self {
    let queue_depth = state.runtime.ingress_queue_depth;
    let purge_delay = state.runtime.transaction_purging_delay;

    let state = Arc::new(Mutex::new(state));
    let shutdown = Arc::new(AtomicBool::new(false));
    let timers = Arc::new(TimerService::new());
    let (ingress, receiver) = bounded(queue_depth);

    let mut threads = Vec::new();
    threads.push(spawn_consumer(
      Arc::clone(&state),
      Arc::clone(&sink),
      receiver,
    ));
    threads.push(spawn_purger(
      Arc::clone(&state),
      Arc::clone(&shutdown),
      purge_delay,
    ));
    threads.push(spawn_replayer(
      Arc::clone(&state),
      Arc::clone(&sink),
      Arc::clone(&shutdown),
    ));
    if let Some(baker) = baker {
      threads.push(spawn_baker(
        Arc::clone(&state),
        Arc::clone(&sink),
        Arc::clone(&shutdown),
        baker,
      ));
    }

    Self {
      state,
      sink,
      ingress,
      shutdown,
      timers,
      threads,
    }
  }

  pub fn ingress(&self) -> Sender<InboundMessage> {
    self.ingress.clone()
  }

  pub fn send(&self, message: InboundMessage) -> Result<()> {
    self.ingress.send(message)?;
    Ok(())
  }

  pub fn timers(&self) -> &TimerService {
    &self.timers
  }

  /// Snapshot-reads the state under the consensus lock.
  pub fn run_state_query<T>(&self, query: impl FnOnce(&SkovState) -> T) -> T {
    query(&self.state.lock())
  }

  /// Feeds a message synchronously, bypassing the channel; used by
  /// the block importer and by tests.
  pub fn execute(&self, message: InboundMessage) -> UpdateResult {
    let tick = Tick::now();
    let mut events = Vec::new();
    let result = {
      let mut state = self.state.lock();
      let result = dispatch_message(&mut state, message, tick);
      drain_events(&mut state, &mut events);
      result
    };
    dispatch_events(&self.sink, events);
    result
  }

  /// Stops every thread, cancels timers and waits for the lock to
  /// settle.
  pub fn stop(mut self) {
    info!("shutting down the runner");
    self.shutdown.store(true, Ordering::SeqCst);
    self.timers.cancel_all();
    let _ = self.ingress.send(InboundMessage::Shutdown);
    for thread in self.threads.drain(..) {
      let _ = thread.join();
    }
  }
}

fn dispatch_message(
  state: &mut SkovState,
  message: InboundMessage,
  tick: Tick,
) -> UpdateResult {
  match message {
    InboundMessage::Block(bytes) => state.receive_block(&bytes, tick),
    InboundMessage::Transaction(bytes) => {
      state.receive_transaction(&bytes, tick)
    }
    InboundMessage::FinalizationMessage(bytes) => {
      state.receive_finalization_message(&bytes, tick)
    }
    InboundMessage::FinalizationRecord(bytes) => {
      state.receive_finalization_record(&bytes, tick)
    }
    InboundMessage::CatchUpStatus(bytes) => {
      state.receive_catch_up(&bytes, tick)
    }
    InboundMessage::Shutdown => UpdateResult::Success,
  }
}

fn drain_events(state: &mut SkovState, into: &mut Vec<SkovEvent>) {
  while let Some(event) = state.take_event() {
    into.push(event);
  }
}

fn dispatch_events(sink: &Arc<dyn OutboundSink>, events: Vec<SkovEvent>) {
  for event in events {
    match event {
      SkovEvent::BroadcastBlock(bytes) => sink.broadcast_block(&bytes),
      SkovEvent::BroadcastFinalizationMessage(bytes) => {
        sink.broadcast_finalization_message(&bytes)
      }
      SkovEvent::BroadcastFinalizationRecord(bytes) => {
        sink.broadcast_finalization_record(&bytes)
      }
      SkovEvent::BroadcastCatchUp(bytes) => sink.broadcast_catch_up(&bytes),
      SkovEvent::DirectBlock { to, bytes } => {
        sink.send_direct_block(to, &bytes)
      }
      SkovEvent::DirectFinalizationRecord { to, bytes } => {
        sink.send_direct_finalization_record(to, &bytes)
      }
      SkovEvent::BlockFinalized {
        block,
        height,
        index,
      } => sink.notify_finalized(block, height, index),
      SkovEvent::ProtocolUpdate(payload) => {
        sink.notify_protocol_update(&payload)
      }
    }
  }
}

fn spawn_consumer(
  state: Arc<Mutex<SkovState>>,
  sink: Arc<dyn OutboundSink>,
  receiver: Receiver<InboundMessage>,
) -> JoinHandle<()> {
  thread::Builder::new()
    .name("skov-consumer".into())
    .spawn(move || {
      while let Ok(message) = receiver.recv() {
        if matches!(message, InboundMessage::Shutdown) {
          break;
        }
        let tick = Tick::now();
        let mut events = Vec::new();
        let result = {
          let mut state = state.lock();
          let result = dispatch_message(&mut state, message, tick);
          drain_events(&mut state, &mut events);
          result
        };
        debug!("ingress message processed: {result:?}");
        dispatch_events(&sink, events);
      }
      debug!("consumer thread exiting");
    })
    .expect("spawning the consumer thread cannot fail")
}

/// Sleeps in short intervals so shutdown is honored promptly.
fn interruptible_sleep(shutdown: &AtomicBool, duration: Duration) {
  let deadline = Instant::now() + duration;
  while !shutdown.load(Ordering::SeqCst) {
    let now = Instant::now();
    if now >= deadline {
      break;
    }
    thread::sleep((deadline - now).min(Duration::from_millis(100)));
  }
}

fn sleep_until_wall(shutdown: &AtomicBool, until: DateTime<Utc>) {
  let now = Utc::now();
  if until > now {
    let remaining = (until - now)
      .to_std()
      .unwrap_or_else(|_| Duration::from_millis(0));
    interruptible_sleep(shutdown, remaining);
  }
}

fn spawn_baker(
  state: Arc<Mutex<SkovState>>,
  sink: Arc<dyn OutboundSink>,
  shutdown: Arc<AtomicBool>,
  baker: BakerIdentity,
) -> JoinHandle<()> {
  thread::Builder::new()
    .name("skov-baker".into())
    .spawn(move || {
      let mut next_slot = 1;
      loop {
        let tick = Tick::now();
        let mut events = Vec::new();
        let outcome = {
          let mut state = state.lock();
          let outcome = try_bake(&mut state, &baker, next_slot, tick, &shutdown);
          drain_events(&mut state, &mut events);
          outcome
        };
        dispatch_events(&sink, events);

        match outcome {
          BakeOutcome::Shutdown => break,
          BakeOutcome::Baked { slot, .. } => {
            next_slot = slot + 1;
            let until = {
              let state = state.lock();
              state.genesis_data().slot_start(next_slot)
            };
            sleep_until_wall(&shutdown, until);
          }
          BakeOutcome::WaitUntil {
            next_slot: slot,
            until,
          } => {
            next_slot = slot;
            sleep_until_wall(&shutdown, until);
          }
        }
      }
      debug!("baker thread exiting");
    })
    .expect("spawning the baker thread cannot fail")
}

fn spawn_purger(
  state: Arc<Mutex<SkovState>>,
  shutdown: Arc<AtomicBool>,
  delay: Duration,
) -> JoinHandle<()> {
  thread::Builder::new()
    .name("skov-tx-purge".into())
    .spawn(move || {
      while !shutdown.load(Ordering::SeqCst) {
        interruptible_sleep(&shutdown, delay);
        if shutdown.load(Ordering::SeqCst) {
          break;
        }
        let tick = Tick::now();
        state.lock().purge_transactions(tick);
      }
      debug!("purge thread exiting");
    })
    .expect("spawning the purge thread cannot fail")
}

fn spawn_replayer(
  state: Arc<Mutex<SkovState>>,
  sink: Arc<dyn OutboundSink>,
  shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
  thread::Builder::new()
    .name("skov-fin-replay".into())
    .spawn(move || {
      while !shutdown.load(Ordering::SeqCst) {
        let delay = {
          let state = state.lock();
          state.finalization().next_replay_delay()
        };
        interruptible_sleep(&shutdown, delay);
        if shutdown.load(Ordering::SeqCst) {
          break;
        }
        let tick = Tick::now();
        let mut events = Vec::new();
        {
          let mut state = state.lock();
          state.finalization_replay_tick(tick);
          drain_events(&mut state, &mut events);
        }
        dispatch_events(&sink, events);
      }
      debug!("replay thread exiting");
    })
    .expect("spawning the replay thread cannot fail")
}

#[cfg(test)]
mod tests {
  use {
    super::{InboundMessage, OutboundSink, Runner, TimerService},
    crate::{
      baker::BakerIdentity,
      crypto::{BlockHash, HashValue, Keypair, VrfKeypair},
      params::{
        timestamp_of,
        BakerInfo,
        BirkParameters,
        FinalizationParameters,
        GenesisData,
        RuntimeParameters,
      },
      scheduler::CountingScheduler,
      serial::WireSerialize,
      skov::{SkovState, Tick},
      transaction::Transaction,
    },
    parking_lot::Mutex,
    std::{
      sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
      },
      time::{Duration, Instant},
    },
  };

  #[derive(Default)]
  struct CollectingSink {
    blocks: Mutex<Vec<Vec<u8>>>,
  }

  impl OutboundSink for CollectingSink {
    fn broadcast_block(&self, bytes: &[u8]) {
      self.blocks.lock().push(bytes.to_vec());
    }
    fn broadcast_finalization_message(&self, _bytes: &[u8]) {}
    fn broadcast_finalization_record(&self, _bytes: &[u8]) {}
    fn broadcast_catch_up(&self, _bytes: &[u8]) {}
    fn send_direct_block(&self, _to: u32, _bytes: &[u8]) {}
    fn send_direct_finalization_record(&self, _to: u32, _bytes: &[u8]) {}
    fn notify_finalized(&self, _block: BlockHash, _height: u64, _index: u64) {}
    fn notify_protocol_update(&self, _payload: &[u8]) {}
  }

  #[test]
  fn runner_bakes_and_broadcasts() {
    let sign: Arc<Keypair> =
      Arc::new([1u8; 32].as_slice().try_into().unwrap());
    let election = Arc::new(VrfKeypair::from_seed(&[1u8; 32]));
    let genesis = GenesisData {
      timestamp: timestamp_of(chrono::Utc::now()),
      slot_duration_millis: 200,
      epoch_length: 1000,
      birk_parameters: BirkParameters::genesis(
        1.0,
        HashValue::digest(b"runner"),
        vec![BakerInfo {
          id: 0,
          signature_key: sign.public(),
          election_key: election.public(),
          stake: 100,
        }],
      ),
      finalization_parameters: FinalizationParameters {
        committee: vec![],
        minimum_skip: 1,
      },
      max_block_size: 1 << 20,
      max_block_energy: 1 << 20,
    };

    let state = SkovState::new(
      genesis,
      RuntimeParameters::default(),
      Arc::new(CountingScheduler::default()),
      None,
      Tick::now(),
    );
    let sink = Arc::new(CollectingSink::default());
    let runner = Runner::start(
      state,
      Arc::clone(&sink) as Arc<dyn OutboundSink>,
      Some(BakerIdentity {
        id: 0,
        sign,
        election,
      }),
    );

    // feed a transaction through the ingress channel; the baker
    // picks it up on a later slot
    let sender: Keypair = [9u8; 32].as_slice().try_into().unwrap();
    let tx = Transaction::new(&sender, 0, 5, b"ping".to_vec());
    runner
      .send(InboundMessage::Transaction(tx.to_bytes()))
      .unwrap();

    std::thread::sleep(Duration::from_millis(1500));
    let height = runner.run_state_query(|state| {
      state.tree().best_block().height
    });
    runner.stop();

    assert!(height >= 1, "the sole baker at difficulty 1.0 must bake");
    assert!(!sink.blocks.lock().is_empty());
  }

  #[test]
  fn timers_fire_at_or_after_their_deadline() {
    let service = TimerService::new();
    let fired = Arc::new(AtomicU32::new(0));

    let start = Instant::now();
    let counter = Arc::clone(&fired);
    service.schedule(start + Duration::from_millis(50), move || {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn cancelled_timers_never_fire() {
    let service = TimerService::new();
    let fired = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&fired);
    let handle = service
      .schedule(Instant::now() + Duration::from_millis(100), move || {
        counter.fetch_add(1, Ordering::SeqCst);
      });
    handle.cancel();
    // cancellation is idempotent
    handle.cancel();

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn cancel_after_fire_is_a_noop() {
    let service = TimerService::new();
    let fired = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&fired);
    let handle = service
      .schedule(Instant::now() + Duration::from_millis(10), move || {
        counter.fetch_add(1, Ordering::SeqCst);
      });
    std::thread::sleep(Duration::from_millis(150));
    handle.cancel();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }
}
