//! The pool actor owns all state derived from the event history.
//!
//! It is reached exclusively through a [`PoolHandle`]. Every request is
//! handled to completion, followed by applying whatever contiguous events have
//! become available and waking the awaiters whose condition now holds, so
//! that applying an event, advancing time and waking waiters is atomic with
//! respect to everything else.

mod handle;
mod msg;
pub(crate) mod state;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::channel::oneshot;
use futures::stream::StreamExt;
use instant::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::error::RegistryError;
use crate::error::Stopped;
use crate::event::Event;
use crate::event::EventKind;
use crate::event::Time;
use crate::executor::Executor;
use crate::identifier::Identifier;
use crate::member_set::MemberSetKind;
use crate::snapshot::PoolSnapshot;

pub(crate) use handle::PoolHandle;

use msg::Request;
use msg::Response;
use state::PoolState;

type RequestAndResponseSender = (Request, oneshot::Sender<Response>);

/// Events handed to delivery, `None` marks the end.
pub(crate) type Delivery = Option<Arc<Event>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PoolStatus {
    pub time: Time,
    pub initialized: bool,
    pub closed: bool,
    pub terminated: bool,
    pub stopped: bool,
    pub size: usize,
}

pub(crate) struct PoolKit {
    handle: PoolHandle,
    receiver: mpsc::Receiver<RequestAndResponseSender>,
}

impl PoolKit {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(32);

        Self {
            handle: PoolHandle::new(sender),
            receiver,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }
}

pub(crate) struct Pool {
    receiver: mpsc::Receiver<RequestAndResponseSender>,
    name: String,
    heartbeat_interval: Duration,

    identifier: Option<Identifier>,
    state: PoolState,
    initialized: bool,
    stopped: bool,

    time_awaiters: BTreeMap<Time, Vec<oneshot::Sender<()>>>,
    election_awaiters: HashMap<String, Vec<oneshot::Sender<Identifier>>>,
    closed_awaiters: Vec<oneshot::Sender<()>>,
    terminated_awaiters: Vec<oneshot::Sender<Identifier>>,
    stop_awaiters: Vec<oneshot::Sender<()>>,

    maybe_dead_reports: HashMap<Identifier, Instant>,

    event_emitter: mpsc::UnboundedSender<Delivery>,
}

impl Pool {
    pub fn spawn<E: Executor>(
        kit: PoolKit,
        name: String,
        member_set: MemberSetKind,
        heartbeat_interval: Duration,
        event_emitter: mpsc::UnboundedSender<Delivery>,
        executor: &E,
    ) -> Result<PoolHandle, RegistryError> {
        let handle = kit.handle();

        let pool = Self {
            receiver: kit.receiver,
            name,
            heartbeat_interval,

            identifier: None,
            state: PoolState::new(member_set),
            initialized: false,
            stopped: false,

            time_awaiters: BTreeMap::new(),
            election_awaiters: HashMap::new(),
            closed_awaiters: Vec::new(),
            terminated_awaiters: Vec::new(),
            stop_awaiters: Vec::new(),

            maybe_dead_reports: HashMap::new(),

            event_emitter,
        };

        executor
            .execute(pool.run())
            .map_err(RegistryError::spawn)?;

        Ok(handle)
    }

    async fn run(mut self) {
        while let Some((req, resp_sender)) = self.receiver.next().await {
            self.handle_request_msg(req, resp_sender);
            self.handle_events();
            self.notify_awaiters();
        }

        if !self.stopped {
            warn!("Pool `{}` was not stopped but simply dropped.", self.name);
            self.stop();
        }

        debug!("Pool `{}` shut down.", self.name);
    }

    fn handle_request_msg(&mut self, req: Request, resp_sender: oneshot::Sender<Response>) {
        let resp = match req {
            Request::Identify { identifier } => Response::Identify(if self.stopped {
                Err(Stopped)
            } else {
                self.identifier = Some(identifier);
                Ok(())
            }),

            Request::Init { snapshot } => Response::Init(self.init(snapshot)),

            Request::NewEvents { events } => Response::NewEvents(if self.stopped {
                Err(Stopped)
            } else {
                let added = self.state.log_mut().add_all(events);
                trace!("Added {} new events to pool `{}`.", added, self.name);
                Ok(())
            }),

            Request::PurgeHistoryUpTo { time } => Response::PurgeHistoryUpTo(if self.stopped {
                Err(Stopped)
            } else {
                self.purge_history_up_to(time);
                Ok(())
            }),

            Request::Status => Response::Status(Ok(self.status())),

            Request::EventsFrom { start } => {
                Response::EventsFrom(Ok(self.state.log().contiguous_from(start)))
            }

            Request::NextRequiredEvent => Response::NextRequiredEvent(Ok(self
                .state
                .log()
                .lowest_missing_from(self.state.time()))),

            Request::PrepareSnapshot { signals_since } => {
                Response::PrepareSnapshot(if self.initialized {
                    self.state
                        .snapshot(signals_since)
                        .map(Some)
                        .map_err(RegistryError::from)
                } else {
                    Ok(None)
                })
            }

            Request::RandomMember { exclude_self } => {
                let excluding = self.identifier.as_ref().filter(|_| exclude_self);

                Response::RandomMember(Ok(self
                    .state
                    .members()
                    .random_member(excluding)
                    .map(|m| m.identifier().clone())))
            }

            Request::Children => Response::Children(Ok(match &self.identifier {
                Some(identifier) => self
                    .state
                    .members()
                    .children_of(identifier)
                    .into_iter()
                    .map(|m| m.identifier().clone())
                    .collect(),
                None => Vec::new(),
            })),

            Request::Members => Response::Members(Ok(self
                .state
                .members()
                .members()
                .into_iter()
                .map(|m| m.identifier().clone())
                .collect())),

            Request::IsMember { identifier } => {
                Response::IsMember(Ok(self.state.members().contains(&identifier)))
            }

            Request::ElectionResult { name } => Response::ElectionResult(Ok(self
                .state
                .elections()
                .get(&name)
                .map(|e| e.winner().clone()))),

            Request::WonElections => Response::WonElections(Ok(match &self.identifier {
                Some(identifier) => self.state.elections().won_by(identifier),
                None => Vec::new(),
            })),

            Request::MustReportMaybeDead { identifier } => {
                Response::MustReportMaybeDead(Ok(self.must_report_maybe_dead(identifier)))
            }

            Request::AwaitTime { time } => {
                let (s, r) = oneshot::channel();

                if !self.stopped {
                    self.time_awaiters.entry(time).or_default().push(s);
                }

                Response::AwaitTime(Ok(r))
            }

            Request::AwaitElection { name } => {
                let (s, r) = oneshot::channel();

                if !self.stopped {
                    self.election_awaiters.entry(name).or_default().push(s);
                }

                Response::AwaitElection(Ok(r))
            }

            Request::AwaitClosed => {
                let (s, r) = oneshot::channel();

                if !self.stopped {
                    self.closed_awaiters.push(s);
                }

                Response::AwaitClosed(Ok(r))
            }

            Request::AwaitTerminated => {
                let (s, r) = oneshot::channel();

                if !self.stopped {
                    self.terminated_awaiters.push(s);
                }

                Response::AwaitTerminated(Ok(r))
            }

            Request::AwaitStop => {
                let (s, r) = oneshot::channel();

                if self.stopped {
                    let _ = s.send(());
                } else {
                    self.stop_awaiters.push(s);
                }

                Response::AwaitStop(Ok(r))
            }

            Request::Stop => {
                self.stop();

                Response::Stop(Ok(()))
            }
        };

        let _ = resp_sender.send(resp);
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            time: self.state.time(),
            initialized: self.initialized,
            closed: self.state.close_event().is_some(),
            terminated: self.state.terminate_event().is_some(),
            stopped: self.stopped,
            size: self.state.members().len(),
        }
    }

    fn init(&mut self, snapshot: PoolSnapshot) -> Result<bool, RegistryError> {
        if self.stopped {
            return Err(RegistryError::Stopped);
        }

        if self.initialized {
            debug!("Pool `{}` already initialized, ignoring snapshot.", self.name);
            return Ok(false);
        }

        self.state.restore(&snapshot)?;
        self.initialized = true;

        info!(
            "Pool `{}` initialized at time {} with {} members.",
            self.name,
            snapshot.time(),
            self.state.members().len()
        );

        for event in self.state.history(&snapshot.signals) {
            self.deliver(event);
        }

        Ok(true)
    }

    fn purge_history_up_to(&mut self, time: Time) {
        if self.initialized && self.state.time() < time {
            warn!(
                "Pool `{}` cannot purge history up to {}, it is only at {}.",
                self.name,
                time,
                self.state.time()
            );
            return;
        }

        self.state.log_mut().purge_below(time);
    }

    fn must_report_maybe_dead(&mut self, identifier: Identifier) -> bool {
        let now = Instant::now();

        match self.maybe_dead_reports.get(&identifier) {
            Some(last) if now.duration_since(*last) < self.heartbeat_interval => false,
            _ => {
                self.maybe_dead_reports.insert(identifier, now);
                true
            }
        }
    }

    fn handle_events(&mut self) {
        if !self.initialized {
            return;
        }

        while !self.stopped {
            let event = match self.state.apply_next() {
                Some(event) => event,
                None => break,
            };

            trace!("Pool `{}` applied {}.", self.name, event);

            match event.kind() {
                EventKind::Leave | EventKind::Died => {
                    if let Some(subject) = event.subject() {
                        self.maybe_dead_reports.remove(subject);
                    }
                }
                EventKind::PoolClosed => info!("Pool `{}` is now closed.", self.name),
                EventKind::PoolTerminated => info!("Pool `{}` terminated.", self.name),
                _ => {}
            }

            let died = event.kind() == EventKind::Died
                && self.identifier.as_ref().map_or(false, |i| event.concerns(i));

            self.deliver(event);

            if died {
                warn!("Pool `{}` declared this member dead, stopping.", self.name);
                self.stop();
            }
        }
    }

    fn deliver(&mut self, event: Arc<Event>) {
        if event.kind() == EventKind::Signal {
            let addressed = self
                .identifier
                .as_ref()
                .map_or(false, |i| event.destinations().contains(i));

            if !addressed {
                return;
            }
        }

        let _ = self.event_emitter.unbounded_send(Some(event));
    }

    fn notify_awaiters(&mut self) {
        if !self.initialized || self.stopped {
            return;
        }

        let pending = self.time_awaiters.split_off(&(self.state.time() + 1));
        for s in std::mem::replace(&mut self.time_awaiters, pending)
            .into_values()
            .flatten()
        {
            let _ = s.send(());
        }

        let elections = self.state.elections();
        self.election_awaiters.retain(|name, awaiters| {
            match elections.get(name) {
                Some(election) => {
                    for s in awaiters.drain(..) {
                        let _ = s.send(election.winner().clone());
                    }
                    false
                }
                None => true,
            }
        });

        if self.state.close_event().is_some() {
            for s in self.closed_awaiters.drain(..) {
                let _ = s.send(());
            }
        }

        if let Some(terminator) = self.state.terminate_event().and_then(|e| e.subject()) {
            for s in self.terminated_awaiters.drain(..) {
                let _ = s.send(terminator.clone());
            }
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }

        self.stopped = true;

        // dropping the senders wakes every awaiter with an error
        self.time_awaiters.clear();
        self.election_awaiters.clear();
        self.closed_awaiters.clear();
        self.terminated_awaiters.clear();

        for s in self.stop_awaiters.drain(..) {
            let _ = s.send(());
        }

        let _ = self.event_emitter.unbounded_send(None);

        info!("Pool `{}` stopped at time {}.", self.name, self.state.time());
    }
}
