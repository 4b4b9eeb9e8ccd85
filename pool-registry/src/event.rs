//! Events are the facts the server orders and every member applies.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use smallvec::SmallVec;

use crate::identifier::Identifier;

/// Pool time, i.e. the sequence number of an event.
pub type Time = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Join,
    Leave,
    Died,
    Signal,
    Elect,
    Unelect,
    PoolClosed,
    PoolTerminated,
}

impl EventKind {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            EventKind::Join => 1,
            EventKind::Leave => 2,
            EventKind::Died => 3,
            EventKind::Signal => 4,
            EventKind::Elect => 5,
            EventKind::Unelect => 6,
            EventKind::PoolClosed => 7,
            EventKind::PoolTerminated => 8,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => EventKind::Join,
            2 => EventKind::Leave,
            3 => EventKind::Died,
            4 => EventKind::Signal,
            5 => EventKind::Elect,
            6 => EventKind::Unelect,
            7 => EventKind::PoolClosed,
            8 => EventKind::PoolTerminated,
            _ => return None,
        })
    }
}

/// An immutable, time stamped fact about a pool.
///
/// The first identifier is the event's subject: the member that joined, left
/// or died, the winner of an election, the source of a signal or the member
/// that terminated the pool. Signals list their destinations after the source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    kind: EventKind,
    time: Time,
    description: Option<String>,
    ibises: SmallVec<[Identifier; 1]>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        time: Time,
        description: Option<String>,
        ibises: impl IntoIterator<Item = Identifier>,
    ) -> Self {
        Self {
            kind,
            time,
            description,
            ibises: ibises.into_iter().collect(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn ibises(&self) -> &[Identifier] {
        &self.ibises
    }

    pub fn subject(&self) -> Option<&Identifier> {
        self.ibises.first()
    }

    /// Members a signal is addressed to.
    pub fn destinations(&self) -> &[Identifier] {
        match self.kind {
            EventKind::Signal if !self.ibises.is_empty() => &self.ibises[1..],
            _ => &[],
        }
    }

    pub fn concerns(&self, identifier: &Identifier) -> bool {
        self.subject() == Some(identifier)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.kind, self.time)?;

        if let Some(d) = &self.description {
            write!(f, " \"{}\"", d)?;
        }

        for ibis in &self.ibises {
            write!(f, " {}", ibis)?;
        }

        Ok(())
    }
}
