//! Double-buffered event pipeline.
//!
//! Drivers push events from arbitrary threads; a single worker thread owns
//! all outbound dispatch. Producers append to the free list under a short
//! lock and post a wakeup that is immediate when the last dispatch is older
//! than the dispatch interval, otherwise delayed by the remainder — that
//! delay is the coalescing window. The worker swaps buffers under the same
//! lock and fans the frozen batch out with no lock held.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use vehicle_hal::PropertyValue;

/// A HAL error travelling the error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HalErrorEvent {
    pub error_code: i32,
    /// 0 for global errors
    pub property: i32,
    pub operation: i32,
}

/// Receives frozen batches from the worker. Implemented by the broker core.
pub(crate) trait EventDispatcher: Send + Sync {
    fn dispatch_events(&self, events: Vec<PropertyValue>);
    fn dispatch_error(&self, error: HalErrorEvent);
}

enum WorkerMessage {
    /// Dispatch accumulated events once `due` is reached
    Events { due: Instant },
    /// Dispatch one queued error
    Error,
    Shutdown,
}

struct Buffers {
    lists: [Vec<PropertyValue>; 2],
    free_index: usize,
    last_dispatch: Option<Instant>,
    errors: VecDeque<HalErrorEvent>,
}

impl Buffers {
    fn new() -> Self {
        Self {
            lists: [Vec::new(), Vec::new()],
            free_index: 0,
            last_dispatch: None,
            errors: VecDeque::new(),
        }
    }
}

/// Swap out everything queued for dispatch, preserving insertion order.
///
/// If the non-free list still holds an undispatched batch, the free list is
/// appended to it so nothing is reordered; otherwise the lists flip and the
/// previously free list is frozen.
fn take_batch(buffers: &mut Buffers) -> Vec<PropertyValue> {
    buffers.last_dispatch = Some(Instant::now());
    let free = buffers.free_index;
    let non_free = free ^ 1;
    if !buffers.lists[non_free].is_empty() {
        let tail = std::mem::take(&mut buffers.lists[free]);
        buffers.lists[non_free].extend(tail);
        std::mem::take(&mut buffers.lists[non_free])
    } else if !buffers.lists[free].is_empty() {
        buffers.free_index = non_free;
        std::mem::take(&mut buffers.lists[free])
    } else {
        Vec::new()
    }
}

/// Producer-side handle to the pipeline. Owned by the broker core; the
/// worker thread holds the buffers through [`WorkerContext`].
pub(crate) struct EventPipeline {
    buffers: Arc<Mutex<Buffers>>,
    tx: Sender<WorkerMessage>,
    dispatch_interval: Duration,
}

/// Everything the worker thread needs, split off at construction.
pub(crate) struct WorkerContext {
    buffers: Arc<Mutex<Buffers>>,
    rx: Receiver<WorkerMessage>,
}

impl EventPipeline {
    pub(crate) fn new(dispatch_interval: Duration) -> (Self, WorkerContext) {
        let (tx, rx) = mpsc::channel();
        let buffers = Arc::new(Mutex::new(Buffers::new()));
        let pipeline = Self {
            buffers: Arc::clone(&buffers),
            tx,
            dispatch_interval,
        };
        (pipeline, WorkerContext { buffers, rx })
    }

    /// Take ownership of `value` and schedule a dispatch. Callable from any
    /// thread; never blocks on delivery.
    pub(crate) fn publish_event(&self, value: PropertyValue) {
        let due = {
            let mut buffers = match self.buffers.lock() {
                Ok(b) => b,
                Err(_) => {
                    tracing::warn!("event pipeline lock poisoned, dropping event");
                    return;
                }
            };
            let index = buffers.free_index;
            buffers.lists[index].push(value);
            match buffers.last_dispatch {
                Some(last) if last.elapsed() <= self.dispatch_interval => {
                    last + self.dispatch_interval
                }
                _ => Instant::now(),
            }
        };
        let _ = self.tx.send(WorkerMessage::Events { due });
    }

    /// Queue an error for dispatch. Errors go out one at a time, FIFO.
    pub(crate) fn publish_error(&self, error: HalErrorEvent) {
        {
            let mut buffers = match self.buffers.lock() {
                Ok(b) => b,
                Err(_) => {
                    tracing::warn!("event pipeline lock poisoned, dropping error");
                    return;
                }
            };
            buffers.errors.push_back(error);
        }
        let _ = self.tx.send(WorkerMessage::Error);
    }

    /// Drop all buffered events. Called on a mock swap; wakeups already in
    /// flight find empty buffers and no-op.
    pub(crate) fn discard_events(&self) {
        if let Ok(mut buffers) = self.buffers.lock() {
            let dropped = buffers.lists[0].len() + buffers.lists[1].len();
            buffers.lists[0].clear();
            buffers.lists[1].clear();
            if dropped > 0 {
                tracing::debug!("discarded {} buffered events on HAL swap", dropped);
            }
        }
    }

    /// Ask the worker to exit after draining queued messages.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(WorkerMessage::Shutdown);
    }

    /// Append pipeline state to the diagnostic dump.
    pub(crate) fn dump(&self, w: &mut dyn std::fmt::Write) {
        if let Ok(buffers) = self.buffers.lock() {
            let age = buffers
                .last_dispatch
                .map(|t| t.elapsed().as_millis() as i64)
                .unwrap_or(-1);
            let _ = writeln!(
                w,
                "free_index:{}, ms since last dispatch:{}, queued:{}+{}, errors queued:{}",
                buffers.free_index,
                age,
                buffers.lists[0].len(),
                buffers.lists[1].len(),
                buffers.errors.len()
            );
        }
    }
}

/// Spawn the dedicated dispatch worker.
///
/// The worker holds only a weak reference to the dispatcher so a released
/// broker winds the thread down instead of being kept alive by it.
pub(crate) fn spawn_event_worker(
    ctx: WorkerContext,
    dispatcher: Weak<dyn EventDispatcher>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        tracing::debug!("event worker started");
        while let Ok(message) = ctx.rx.recv() {
            match message {
                WorkerMessage::Events { due } => {
                    let now = Instant::now();
                    if due > now {
                        thread::sleep(due - now);
                    }
                    let batch = match ctx.buffers.lock() {
                        Ok(mut buffers) => take_batch(&mut buffers),
                        Err(_) => {
                            tracing::warn!("event pipeline lock poisoned, worker exiting");
                            break;
                        }
                    };
                    if batch.is_empty() {
                        continue;
                    }
                    let Some(dispatcher) = dispatcher.upgrade() else {
                        break;
                    };
                    dispatcher.dispatch_events(batch);
                }
                WorkerMessage::Error => {
                    let error = match ctx.buffers.lock() {
                        Ok(mut buffers) => buffers.errors.pop_front(),
                        Err(_) => break,
                    };
                    if let Some(error) = error {
                        let Some(dispatcher) = dispatcher.upgrade() else {
                            break;
                        };
                        dispatcher.dispatch_error(error);
                    }
                }
                WorkerMessage::Shutdown => break,
            }
        }
        tracing::debug!("event worker stopped");
    })
}

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds on a process-local monotonic clock. Stamps dispatch batches
/// and drop counters the way the service's original clock did.
pub(crate) fn monotonic_now_ns() -> i64 {
    let epoch = *PROCESS_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as i64
}
