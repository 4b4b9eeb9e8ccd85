use std::collections::BTreeMap;
use std::sync::Arc;

use crate::event::Event;
use crate::event::EventKind;
use crate::event::Time;

/// Events keyed by time.
///
/// Insertion order is irrelevant and duplicates are dropped, which is what
/// allows events to arrive from the server, gossip partners and push parents
/// concurrently.
#[derive(Debug, Default)]
pub(crate) struct EventLog {
    events: BTreeMap<Time, Arc<Event>>,
    minimum: Time,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `event` unless an event with the same time is already present or
    /// the time has been purged. Returns whether the event was inserted.
    pub fn add(&mut self, event: Arc<Event>) -> bool {
        if event.time() < self.minimum {
            return false;
        }

        match self.events.entry(event.time()) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(event);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn add_all(&mut self, events: impl IntoIterator<Item = Arc<Event>>) -> usize {
        events.into_iter().filter(|e| self.add(Arc::clone(e))).count()
    }

    pub fn get(&self, time: Time) -> Option<&Arc<Event>> {
        self.events.get(&time)
    }

    /// The longest gap free run of events starting at `start`.
    pub fn contiguous_from(&self, start: Time) -> Vec<Arc<Event>> {
        let mut expected = start;

        self.events
            .range(start..)
            .take_while(|(&t, _)| {
                let matches = t == expected;
                expected = expected.wrapping_add(1);
                matches
            })
            .map(|(_, e)| Arc::clone(e))
            .collect()
    }

    /// The lowest time at or above `start` for which no event is present.
    pub fn lowest_missing_from(&self, start: Time) -> Time {
        let start = start.max(self.minimum);
        let mut expected = start;

        for &t in self.events.range(start..).map(|(t, _)| t) {
            if t != expected {
                break;
            }

            expected += 1;
        }

        expected
    }

    /// Discards all events below `time`. Events below it will not be accepted
    /// anymore either.
    pub fn purge_below(&mut self, time: Time) {
        if time <= self.minimum {
            return;
        }

        self.events = self.events.split_off(&time);
        self.minimum = time;
    }

    /// Signal events with `from <= time < to`.
    pub fn signal_events(&self, from: Time, to: Time) -> Vec<Arc<Event>> {
        if from >= to {
            return Vec::new();
        }

        self.events
            .range(from..to)
            .map(|(_, e)| e)
            .filter(|e| e.kind() == EventKind::Signal)
            .map(Arc::clone)
            .collect()
    }

    #[cfg(any(test, feature = "prototyping"))]
    pub fn minimum(&self) -> Time {
        self.minimum
    }

    #[cfg(any(test, feature = "prototyping"))]
    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::identifier::Identifier;

    fn event(kind: EventKind, time: Time) -> Arc<Event> {
        let ibis = Identifier::new(u64::from(time), "pool", "addr", "loc", Vec::new());
        Arc::new(Event::new(kind, time, None, vec![ibis]))
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut log = EventLog::new();

        assert!(log.add(event(EventKind::Join, 0)));
        assert!(!log.add(event(EventKind::Leave, 0)));

        assert_eq!(log.len(), 1);
        assert_eq!(log.get(0).unwrap().kind(), EventKind::Join);
    }

    #[test]
    fn contiguous_run_stops_at_first_gap() {
        let mut log = EventLog::new();

        log.add_all(vec![
            event(EventKind::Join, 3),
            event(EventKind::Join, 0),
            event(EventKind::Join, 1),
        ]);

        let times = log
            .contiguous_from(0)
            .iter()
            .map(|e| e.time())
            .collect::<Vec<_>>();

        assert_eq!(times, vec![0, 1]);
        assert!(log.contiguous_from(2).is_empty());
        assert_eq!(log.contiguous_from(3).len(), 1);
    }

    #[test]
    fn lowest_missing_skips_present_prefix() {
        let mut log = EventLog::new();

        log.add_all((0..4).filter(|t| *t != 2).map(|t| event(EventKind::Join, t)));

        assert_eq!(log.lowest_missing_from(0), 2);
        assert_eq!(log.lowest_missing_from(3), 4);
        assert_eq!(log.lowest_missing_from(7), 7);
    }

    #[test]
    fn purged_times_are_not_readmitted() {
        let mut log = EventLog::new();

        log.add_all((0..5).map(|t| event(EventKind::Join, t)));
        log.purge_below(3);

        assert_eq!(log.minimum(), 3);
        assert_eq!(log.len(), 2);
        assert!(!log.add(event(EventKind::Join, 1)));
        assert_eq!(log.lowest_missing_from(0), 5);

        // purging is monotonic
        log.purge_below(1);
        assert_eq!(log.minimum(), 3);
    }

    #[test]
    fn signal_events_are_filtered_by_kind_and_range() {
        let mut log = EventLog::new();

        log.add(event(EventKind::Join, 0));
        log.add(event(EventKind::Signal, 1));
        log.add(event(EventKind::Signal, 2));
        log.add(event(EventKind::Signal, 3));

        let times = log
            .signal_events(1, 3)
            .iter()
            .map(|e| e.time())
            .collect::<Vec<_>>();

        assert_eq!(times, vec![1, 2]);
        assert!(log.signal_events(3, 3).is_empty());
    }
}
