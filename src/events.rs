//! In-process event bus.
//!
//! Posters enqueue typed events; a single delivery worker drains the queue
//! and invokes every handler registered for `(base, id)` or for the whole
//! base.  Handlers never run on the poster's context.
//!
//! ```text
//! ┌─────────────┐  post()  ┌───────────────────────┐  receive  ┌──────────┐
//! │ services    │─────────▶│                       │──────────▶│  worker  │──▶ handlers
//! │ protection  │─────────▶│  Channel<Msg, 32>     │           │  thread  │
//! │ automation  │─────────▶│  (FIFO, bounded)      │           └──────────┘
//! └─────────────┘          └───────────────────────┘
//! ```
//!
//! The queue is an `embassy-sync` channel, so delivery order is strictly
//! FIFO across all posters.  Payloads are deep-copied at post time and
//! owned by the bus until every handler has seen them.
//!
//! `post` must not be called while holding a lock that a handler may take.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use log::{debug, info, warn};
use serde_json::Value;

use crate::error::{Error, Result, relock};
use crate::task::{self, Core};

/// Queue depth.  Normal-priority posts fail fast once this many events wait.
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// How long a high-priority post waits for queue space.
pub const HIGH_PRIORITY_WAIT: Duration = Duration::from_millis(100);

// ── Event identity ───────────────────────────────────────────

/// Coarse event family.  Ids are scoped per base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventBase {
    Service,
    Config,
    Power,
    Temp,
    Automation,
    Network,
    System,
}

impl EventBase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Config => "config",
            Self::Power => "power",
            Self::Temp => "temp",
            Self::Automation => "automation",
            Self::Network => "network",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    None,
    Bytes(Vec<u8>),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub base: EventBase,
    pub id: u16,
    pub data: EventData,
}

impl Event {
    pub fn json(&self) -> Option<&Value> {
        match &self.data {
            EventData::Json(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Fail with `Busy` when the queue is full.
    Normal,
    /// Wait up to [`HIGH_PRIORITY_WAIT`] for space, then `Timeout`.
    High,
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub posted: u32,
    pub delivered: u32,
    pub dropped: u32,
}

// ── Bus ──────────────────────────────────────────────────────

enum Msg {
    Deliver(Event),
    Stop,
}

struct Subscriber {
    id: HandlerId,
    base: EventBase,
    /// `None` matches every id under `base`.
    event_id: Option<u16>,
    handler: EventHandler,
}

pub struct EventBus {
    queue: Channel<CriticalSectionRawMutex, Msg, EVENT_QUEUE_DEPTH>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_handler: AtomicU32,
    posted: AtomicU32,
    delivered: AtomicU32,
    dropped: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Set by `stop_worker`; the worker drains what is queued and exits.
    stopping: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            queue: Channel::new(),
            subscribers: Mutex::new(Vec::new()),
            next_handler: AtomicU32::new(1),
            posted: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
            worker: Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    /// Post raw bytes.  The bus copies `data`; an empty slice posts no payload.
    pub fn post(&self, base: EventBase, id: u16, data: &[u8], priority: Priority) -> Result<()> {
        let data = if data.is_empty() {
            EventData::None
        } else {
            EventData::Bytes(data.to_vec())
        };
        self.enqueue(Event { base, id, data }, priority)
    }

    /// Post a JSON payload.
    pub fn post_json(&self, base: EventBase, id: u16, data: Value, priority: Priority) -> Result<()> {
        self.enqueue(
            Event {
                base,
                id,
                data: EventData::Json(data),
            },
            priority,
        )
    }

    fn enqueue(&self, event: Event, priority: Priority) -> Result<()> {
        match self.queue.try_send(Msg::Deliver(event)) {
            Ok(()) => {
                self.posted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(msg)) if priority == Priority::High => {
                let sent = futures_lite::future::block_on(futures_lite::future::or(
                    async move {
                        self.queue.send(msg).await;
                        true
                    },
                    async {
                        async_io_mini::Timer::after(HIGH_PRIORITY_WAIT).await;
                        false
                    },
                ));
                if sent {
                    self.posted.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("EventBus: high-priority post timed out");
                    Err(Error::Timeout)
                }
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("EventBus: queue full, event dropped");
                Err(Error::Busy)
            }
        }
    }

    /// Subscribe to `(base, id)`, or to every id of `base` when `id` is `None`.
    pub fn register<F>(&self, base: EventBase, id: Option<u16>, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let hid = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        relock(self.subscribers.lock()).push(Subscriber {
            id: hid,
            base,
            event_id: id,
            handler: Arc::new(handler),
        });
        hid
    }

    pub fn unregister(&self, handle: HandlerId) -> Result<()> {
        let mut subs = relock(self.subscribers.lock());
        let before = subs.len();
        subs.retain(|s| s.id != handle);
        if subs.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        relock(self.subscribers.lock()).len()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            posted: self.posted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Deliver everything queued right now on the calling thread.
    /// Returns the number of events delivered.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while let Ok(msg) = self.queue.try_receive() {
            if let Msg::Deliver(ev) = msg {
                self.deliver(&ev);
                n += 1;
            }
        }
        n
    }

    fn deliver(&self, event: &Event) {
        // Snapshot matching handlers so none runs under the table lock.
        let handlers: Vec<EventHandler> = relock(self.subscribers.lock())
            .iter()
            .filter(|s| s.base == event.base && s.event_id.is_none_or(|id| id == event.id))
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for h in handlers {
            h(event);
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    // ── Worker lifecycle ─────────────────────────────────────

    /// Spawn the delivery worker.  `InvalidState` if already running.
    pub fn start_worker(self: &Arc<Self>) -> Result<()> {
        let mut worker = relock(self.worker.lock());
        if worker.is_some() {
            return Err(Error::InvalidState);
        }
        self.stopping.store(false, Ordering::SeqCst);
        let bus = Arc::clone(self);
        let handle = task::spawn_on_core(Core::Pro, 6, 6, "evt-bus\0", move || bus.run_worker())
            .map_err(|_| Error::NoMem)?;
        *worker = Some(handle);
        info!("EventBus: worker started (depth {})", EVENT_QUEUE_DEPTH);
        Ok(())
    }

    /// Stop the worker after it has delivered everything queued before this call.
    /// Never waits for queue space.
    pub fn stop_worker(&self) -> Result<()> {
        let Some(handle) = relock(self.worker.lock()).take() else {
            return Err(Error::InvalidState);
        };
        self.stopping.store(true, Ordering::SeqCst);
        if handle.thread().id() == std::thread::current().id() {
            // Stopped from one of our own handlers; the loop exits on return.
            return Ok(());
        }
        // Wake an idle worker.  A full queue means it is already awake.
        let _ = self.queue.try_send(Msg::Stop);
        if handle.join().is_err() {
            warn!("EventBus: worker panicked");
        }
        info!("EventBus: worker stopped");
        Ok(())
    }

    pub fn is_worker_running(&self) -> bool {
        relock(self.worker.lock()).is_some()
    }

    fn run_worker(&self) {
        loop {
            match futures_lite::future::block_on(self.queue.receive()) {
                Msg::Deliver(ev) => self.deliver(&ev),
                Msg::Stop => {}
            }
            if self.stopping.load(Ordering::SeqCst) {
                self.drain();
                break;
            }
        }
    }
}
