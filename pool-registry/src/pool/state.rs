use std::sync::Arc;

use tracing::warn;

use crate::election::Election;
use crate::election::ElectionSet;
use crate::error::IoError;
use crate::event::Event;
use crate::event::EventKind;
use crate::event::Time;
use crate::event_log::EventLog;
use crate::identifier::Identifier;
use crate::member_set::Member;
use crate::member_set::MemberSet;
use crate::member_set::MemberSetKind;
use crate::snapshot::PoolSnapshot;

/// State derived from a pool's event history.
///
/// Events enter through the log and are applied strictly in time order, one at
/// a time. The applied events are always exactly those with a time below
/// `time`.
#[derive(Debug)]
pub(crate) struct PoolState {
    time: Time,
    log: EventLog,
    members: Box<dyn MemberSet>,
    elections: ElectionSet,
    close_event: Option<Arc<Event>>,
    terminate_event: Option<Arc<Event>>,
}

impl PoolState {
    pub fn new(kind: MemberSetKind) -> Self {
        Self {
            time: 0,
            log: EventLog::new(),
            members: kind.create(),
            elections: ElectionSet::default(),
            close_event: None,
            terminate_event: None,
        }
    }

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut EventLog {
        &mut self.log
    }

    pub fn members(&self) -> &dyn MemberSet {
        &*self.members
    }

    pub fn elections(&self) -> &ElectionSet {
        &self.elections
    }

    pub fn close_event(&self) -> Option<&Arc<Event>> {
        self.close_event.as_ref()
    }

    pub fn terminate_event(&self) -> Option<&Arc<Event>> {
        self.terminate_event.as_ref()
    }

    /// Applies the event at `time` if it is present in the log.
    pub fn apply_next(&mut self) -> Option<Arc<Event>> {
        let event = Arc::clone(self.log.get(self.time)?);

        self.apply(&event);
        self.time += 1;

        Some(event)
    }

    /// Creates an event at the current time and applies it right away.
    #[cfg(any(test, feature = "prototyping"))]
    pub fn append(
        &mut self,
        kind: EventKind,
        description: Option<String>,
        ibises: impl IntoIterator<Item = Identifier>,
    ) -> Arc<Event> {
        let event = Arc::new(Event::new(kind, self.time, description, ibises));

        self.log.add(Arc::clone(&event));
        self.apply(&event);
        self.time += 1;

        event
    }

    fn apply(&mut self, event: &Arc<Event>) {
        match event.kind() {
            EventKind::Join => match event.subject() {
                Some(subject) => self
                    .members
                    .add(Member::new(subject.clone(), Arc::clone(event))),
                None => warn!("Ignoring join event without subject: {}", event),
            },
            EventKind::Leave | EventKind::Died => match event.subject() {
                Some(subject) => {
                    if self.members.remove(subject).is_none() {
                        warn!("Event names unknown member: {}", event);
                    }
                }
                None => warn!("Ignoring event without subject: {}", event),
            },
            EventKind::Elect => match Election::from_event(Arc::clone(event)) {
                Some(election) => {
                    self.elections.put(election);
                }
                None => warn!("Ignoring malformed election event: {}", event),
            },
            EventKind::Unelect => match event.description() {
                Some(name) => {
                    self.elections.remove(name);
                }
                None => warn!("Ignoring malformed unelect event: {}", event),
            },
            EventKind::PoolClosed => {
                self.close_event.get_or_insert_with(|| Arc::clone(event));
            }
            EventKind::PoolTerminated => {
                self.terminate_event.get_or_insert_with(|| Arc::clone(event));
            }
            EventKind::Signal => {}
        }
    }

    /// Captures the state at the current time. Signals are included from
    /// `signals_since` on.
    pub fn snapshot(&self, signals_since: Time) -> Result<PoolSnapshot, IoError> {
        Ok(PoolSnapshot {
            time: self.time,
            members: self.members.serialize()?,
            elections: self.elections.serialize()?,
            signals: self.log.signal_events(signals_since, self.time),
            close_event: self.close_event.clone(),
            terminate_event: self.terminate_event.clone(),
        })
    }

    /// Replaces the derived state with the content of `snapshot`.
    ///
    /// Buffered events at or above the snapshot's time are kept and applied
    /// subsequently.
    pub fn restore(&mut self, snapshot: &PoolSnapshot) -> Result<(), IoError> {
        self.members.restore(&snapshot.members)?;
        self.elections.restore(&snapshot.elections)?;
        self.close_event = snapshot.close_event.clone();
        self.terminate_event = snapshot.terminate_event.clone();
        self.time = snapshot.time;

        for signal in &snapshot.signals {
            self.log.add(Arc::clone(signal));
        }

        Ok(())
    }

    /// Events that explain the current state, in time order: joins of current
    /// members, won elections, the given signals, closing and termination.
    pub fn history(&self, signals: &[Arc<Event>]) -> Vec<Arc<Event>> {
        let mut history = self
            .members
            .members()
            .into_iter()
            .map(|m| Arc::clone(m.event()))
            .chain(self.elections.iter().map(|e| Arc::clone(e.event())))
            .chain(signals.iter().cloned())
            .chain(self.close_event.iter().cloned())
            .chain(self.terminate_event.iter().cloned())
            .collect::<Vec<_>>();

        history.sort_by_key(|e| e.time());
        history.dedup_by_key(|e| e.time());

        history
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;

    use super::*;

    fn ibis(id: u64) -> Identifier {
        Identifier::new(id, "pool", format!("addr-{}", id), "loc", Vec::new())
    }

    /// A plausible history as the server would produce it.
    fn history() -> Vec<Arc<Event>> {
        let mut server = PoolState::new(MemberSetKind::List);

        for id in 0..4 {
            server.append(EventKind::Join, None, vec![ibis(id)]);
        }
        server.append(EventKind::Elect, Some("leader".into()), vec![ibis(2)]);
        server.append(EventKind::Elect, Some("leader".into()), vec![ibis(1)]);
        server.append(EventKind::Signal, Some("hi".into()), vec![ibis(0), ibis(3)]);
        server.append(EventKind::Died, None, vec![ibis(2)]);
        server.append(EventKind::Elect, Some("backup".into()), vec![ibis(3)]);
        server.append(EventKind::Unelect, Some("backup".into()), vec![ibis(3)]);
        server.append(EventKind::Leave, None, vec![ibis(1)]);
        server.append(EventKind::Join, None, vec![ibis(4)]);
        server.append(EventKind::PoolClosed, None, Vec::new());

        server.log().contiguous_from(0)
    }

    fn summary(state: &PoolState) -> (Time, Vec<u64>, Vec<(String, u64)>, bool) {
        (
            state.time(),
            state
                .members()
                .members()
                .iter()
                .map(|m| m.identifier().id())
                .collect(),
            state
                .elections()
                .iter()
                .map(|e| (e.name().to_owned(), e.winner().id()))
                .collect(),
            state.close_event().is_some(),
        )
    }

    fn apply_all(state: &mut PoolState) -> Vec<Time> {
        std::iter::from_fn(|| state.apply_next().map(|e| e.time())).collect()
    }

    #[test]
    fn delivery_order_and_duplication_do_not_matter() {
        let events = history();

        let mut reference = PoolState::new(MemberSetKind::List);
        reference.log_mut().add_all(events.iter().cloned());
        apply_all(&mut reference);

        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let mut batches = events.iter().chain(events.iter()).cloned().collect::<Vec<_>>();
            batches.shuffle(&mut rng);

            let mut state = PoolState::new(MemberSetKind::List);
            let mut applied = Vec::new();

            for chunk in batches.chunks(3) {
                state.log_mut().add_all(chunk.iter().cloned());
                applied.extend(apply_all(&mut state));
            }

            assert_eq!(applied, (0..events.len() as Time).collect::<Vec<_>>());
            assert_eq!(summary(&state), summary(&reference));
        }
    }

    #[test]
    fn first_elect_wins_and_deaths_remove_members() {
        let mut state = PoolState::new(MemberSetKind::Tree);
        state.log_mut().add_all(history());
        apply_all(&mut state);

        let (time, members, elections, closed) = summary(&state);

        assert_eq!(time, 13);
        assert_eq!(members, vec![0, 3, 4]);
        assert_eq!(elections, vec![("leader".to_owned(), 2)]);
        assert!(closed);
    }

    #[test]
    fn restored_snapshot_continues_like_direct_application() {
        let events = history();

        let mut direct = PoolState::new(MemberSetKind::List);
        direct.log_mut().add_all(events.iter().cloned());
        apply_all(&mut direct);

        for cut in [0, 1, 5, 9, events.len()] {
            let mut source = PoolState::new(MemberSetKind::List);
            source.log_mut().add_all(events[..cut].iter().cloned());
            apply_all(&mut source);

            let snapshot = source.snapshot(0).unwrap();
            let snapshot =
                futures::executor::block_on(PoolSnapshot::decode(snapshot.encode())).unwrap();

            let mut restored = PoolState::new(MemberSetKind::List);
            restored.restore(&snapshot).unwrap();
            restored.log_mut().add_all(events[cut..].iter().cloned());
            apply_all(&mut restored);

            assert_eq!(summary(&restored), summary(&direct), "cut at {}", cut);
        }
    }

    #[test]
    fn history_is_sorted_by_time() {
        let mut state = PoolState::new(MemberSetKind::List);
        state.log_mut().add_all(history());
        apply_all(&mut state);

        let signals = state.log().signal_events(0, state.time());
        let times = state
            .history(&signals)
            .iter()
            .map(|e| e.time())
            .collect::<Vec<_>>();

        // joins of 0, 3 and 4, the leader election, the signal and closing
        assert_eq!(times, vec![0, 3, 4, 6, 11, 12]);
    }
}
