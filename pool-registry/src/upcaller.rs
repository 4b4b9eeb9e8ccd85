//! Delivery of applied events to the application.
//!
//! The pool hands every applied event to a queue. A dedicated task drains the
//! queue and either invokes the application's [`EventHandler`] or records the
//! event in the downcall lists, so that neither the pool nor any network task
//! ever waits for application code.

use std::sync::Arc;

use futures::channel::mpsc;
use futures::channel::oneshot;
use futures::lock::Mutex;
use futures::stream::StreamExt;
use tracing::debug;
use tracing::warn;

use crate::error::RegistryError;
use crate::event::Event;
use crate::event::EventKind;
use crate::executor::Executor;
use crate::identifier::Identifier;
use crate::pool::Delivery;

/// Callbacks for pool events. Every method defaults to doing nothing.
///
/// Callbacks are invoked one at a time, in event order, on a task of their
/// own.
pub trait EventHandler: Send + Sync + 'static {
    fn joined(&self, _member: &Identifier) {}

    fn left(&self, _member: &Identifier) {}

    fn died(&self, _member: &Identifier) {}

    fn got_signal(&self, _signal: &str, _source: &Identifier) {}

    fn elected(&self, _election: &str, _winner: &Identifier) {}

    fn unelected(&self, _election: &str, _winner: &Identifier) {}

    fn pool_closed(&self) {}

    fn pool_terminated(&self, _source: &Identifier) {}
}

fn invoke(handler: &dyn EventHandler, event: &Event) {
    let subject = event.subject();
    let description = event.description().unwrap_or_default();

    match (event.kind(), subject) {
        (EventKind::Join, Some(s)) => handler.joined(s),
        (EventKind::Leave, Some(s)) => handler.left(s),
        (EventKind::Died, Some(s)) => handler.died(s),
        (EventKind::Signal, Some(s)) => handler.got_signal(description, s),
        (EventKind::Elect, Some(s)) => handler.elected(description, s),
        (EventKind::Unelect, Some(s)) => handler.unelected(description, s),
        (EventKind::PoolClosed, _) => handler.pool_closed(),
        (EventKind::PoolTerminated, Some(s)) => handler.pool_terminated(s),
        _ => warn!("Not delivering malformed event {}.", event),
    }
}

/// Membership changes and signals recorded for applications that poll
/// instead of installing a handler.
#[derive(Debug, Default)]
pub(crate) struct Downcalls {
    pub joined: Vec<Identifier>,
    pub left: Vec<Identifier>,
    pub died: Vec<Identifier>,
    pub signals: Vec<String>,
}

impl Downcalls {
    fn record(&mut self, event: &Event) {
        let subject = match event.subject() {
            Some(subject) => subject.clone(),
            None => return,
        };

        match event.kind() {
            EventKind::Join => self.joined.push(subject),
            EventKind::Leave => self.left.push(subject),
            EventKind::Died => self.died.push(subject),
            EventKind::Signal => self
                .signals
                .push(event.description().unwrap_or_default().to_owned()),
            _ => {}
        }
    }
}

pub(crate) enum Sink {
    Handler(Arc<dyn EventHandler>),
    Downcalls(Arc<Mutex<Downcalls>>),
    Discard,
}

#[derive(Debug, Default)]
struct GateState {
    enabled: bool,
    busy: bool,
    enable_waiters: Vec<oneshot::Sender<()>>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

/// Lets callbacks through only while enabled and tracks whether one is in
/// flight.
#[derive(Debug, Default)]
struct Gate(Mutex<GateState>);

impl Gate {
    async fn enter(&self) {
        loop {
            let enabled = {
                let mut state = self.0.lock().await;

                if state.enabled {
                    state.busy = true;
                    return;
                }

                let (s, r) = oneshot::channel();
                state.enable_waiters.push(s);
                r
            };

            let _ = enabled.await;
        }
    }

    async fn exit(&self) {
        let mut state = self.0.lock().await;

        state.busy = false;

        for s in state.idle_waiters.drain(..) {
            let _ = s.send(());
        }
    }

    async fn enable(&self) {
        let mut state = self.0.lock().await;

        state.enabled = true;

        for s in state.enable_waiters.drain(..) {
            let _ = s.send(());
        }
    }

    async fn disable(&self) {
        let idle = {
            let mut state = self.0.lock().await;

            state.enabled = false;

            if !state.busy {
                return;
            }

            let (s, r) = oneshot::channel();
            state.idle_waiters.push(s);
            r
        };

        let _ = idle.await;
    }
}

pub(crate) struct Upcaller {
    gate: Arc<Gate>,
}

impl Upcaller {
    /// Spawns the task draining `deliveries` into `sink`. Events are disabled
    /// initially.
    pub fn spawn<E: Executor>(
        sink: Sink,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        executor: &E,
    ) -> Result<Self, RegistryError> {
        let gate = Arc::new(Gate::default());

        executor
            .execute(consume(sink, Arc::clone(&gate), deliveries))
            .map_err(RegistryError::spawn)?;

        Ok(Self { gate })
    }

    pub async fn enable_events(&self) {
        self.gate.enable().await;
    }

    /// Returns once no callback is running. None is started before events are
    /// enabled again.
    pub async fn disable_events(&self) {
        self.gate.disable().await;
    }
}

async fn consume(sink: Sink, gate: Arc<Gate>, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(Some(event)) = deliveries.next().await {
        match &sink {
            Sink::Handler(handler) => {
                gate.enter().await;

                let delivered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    invoke(&**handler, &event)
                }));

                if delivered.is_err() {
                    warn!("Event handler panicked while handling {}.", event);
                }

                gate.exit().await;
            }
            Sink::Downcalls(downcalls) => downcalls.lock().await.record(&event),
            Sink::Discard => {}
        }
    }

    debug!("Upcaller ended.");
}
