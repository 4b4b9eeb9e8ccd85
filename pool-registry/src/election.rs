use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::error::IoError;
use crate::event::Event;
use crate::event::EventKind;
use crate::identifier::Identifier;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    name: String,
    winner: Identifier,
    event: Arc<Event>,
}

impl Election {
    /// Derives an election from an `ELECT` event, `None` if `event` is
    /// malformed.
    pub fn from_event(event: Arc<Event>) -> Option<Self> {
        if event.kind() != EventKind::Elect {
            return None;
        }

        let name = event.description()?.to_owned();
        let winner = event.subject()?.clone();

        Some(Self {
            name,
            winner,
            event,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn winner(&self) -> &Identifier {
        &self.winner
    }

    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }
}

/// Elections by name. The first announcement of a winner sticks.
#[derive(Debug, Default)]
pub struct ElectionSet {
    elections: BTreeMap<String, Election>,
}

impl ElectionSet {
    /// Records `election` unless its name is already resolved. Returns whether
    /// it was recorded.
    pub fn put(&mut self, election: Election) -> bool {
        match self.elections.entry(election.name.clone()) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(election);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Election> {
        self.elections.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Election> {
        self.elections.remove(name)
    }

    pub fn len(&self) -> usize {
        self.elections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Election> {
        self.elections.values()
    }

    /// Names of the elections won by `identifier`.
    pub fn won_by(&self, identifier: &Identifier) -> Vec<String> {
        self.elections
            .values()
            .filter(|e| &e.winner == identifier)
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, IoError> {
        bincode::serialize(&self.elections.values().collect::<Vec<_>>())
            .map_err(|e| IoError::invalid_data("serializing elections", e))
    }

    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        let elections: Vec<Election> = bincode::deserialize(bytes)
            .map_err(|e| IoError::invalid_data("deserializing elections", e))?;

        self.elections = elections
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elect(name: &str, winner: u64, time: u32) -> Election {
        let winner = Identifier::new(winner, "pool", "addr", "loc", Vec::new());
        let event = Event::new(EventKind::Elect, time, Some(name.to_owned()), vec![winner]);

        Election::from_event(Arc::new(event)).unwrap()
    }

    #[test]
    fn first_winner_sticks() {
        let mut elections = ElectionSet::default();

        assert!(elections.put(elect("leader", 1, 0)));
        assert!(!elections.put(elect("leader", 2, 1)));

        assert_eq!(elections.get("leader").unwrap().winner().id(), 1);
        assert_eq!(elections.len(), 1);
    }

    #[test]
    fn removed_election_can_be_won_again() {
        let mut elections = ElectionSet::default();

        elections.put(elect("leader", 1, 0));
        elections.remove("leader");

        assert!(elections.put(elect("leader", 2, 2)));
        assert_eq!(elections.get("leader").unwrap().winner().id(), 2);
    }

    #[test]
    fn malformed_events_are_rejected() {
        let ibis = Identifier::new(1, "pool", "addr", "loc", Vec::new());

        let no_name = Event::new(EventKind::Elect, 0, None, vec![ibis.clone()]);
        let wrong_kind = Event::new(EventKind::Join, 0, Some("x".into()), vec![ibis]);

        assert!(Election::from_event(Arc::new(no_name)).is_none());
        assert!(Election::from_event(Arc::new(wrong_kind)).is_none());
    }

    #[test]
    fn won_by_and_restore() {
        let mut elections = ElectionSet::default();

        elections.put(elect("a", 1, 0));
        elections.put(elect("b", 2, 1));
        elections.put(elect("c", 1, 2));

        let mut restored = ElectionSet::default();
        restored.restore(&elections.serialize().unwrap()).unwrap();

        let winner = elections.get("a").unwrap().winner().clone();
        assert_eq!(restored.won_by(&winner), vec!["a".to_owned(), "c".to_owned()]);
        assert_eq!(restored.len(), 3);
    }
}
