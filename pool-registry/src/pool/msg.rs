use std::convert::Infallible;
use std::sync::Arc;

use futures::channel::oneshot;

use crate::error::RegistryError;
use crate::error::Stopped;
use crate::event::Event;
use crate::event::Time;
use crate::identifier::Identifier;
use crate::snapshot::PoolSnapshot;

use super::PoolStatus;

#[derive(Debug)]
pub enum Request {
    Identify { identifier: Identifier },
    Init { snapshot: PoolSnapshot },
    NewEvents { events: Vec<Arc<Event>> },
    PurgeHistoryUpTo { time: Time },

    Status,
    EventsFrom { start: Time },
    NextRequiredEvent,
    PrepareSnapshot { signals_since: Time },

    RandomMember { exclude_self: bool },
    Children,
    Members,
    IsMember { identifier: Identifier },
    ElectionResult { name: String },
    WonElections,
    MustReportMaybeDead { identifier: Identifier },

    AwaitTime { time: Time },
    AwaitElection { name: String },
    AwaitClosed,
    AwaitTerminated,
    AwaitStop,

    Stop,
}

#[derive(Debug)]
pub enum Response {
    Identify(Result<(), Stopped>),
    Init(Result<bool, RegistryError>),
    NewEvents(Result<(), Stopped>),
    PurgeHistoryUpTo(Result<(), Stopped>),

    Status(Result<PoolStatus, Infallible>),
    EventsFrom(Result<Vec<Arc<Event>>, Infallible>),
    NextRequiredEvent(Result<Time, Infallible>),
    PrepareSnapshot(Result<Option<PoolSnapshot>, RegistryError>),

    RandomMember(Result<Option<Identifier>, Infallible>),
    Children(Result<Vec<Identifier>, Infallible>),
    Members(Result<Vec<Identifier>, Infallible>),
    IsMember(Result<bool, Infallible>),
    ElectionResult(Result<Option<Identifier>, Infallible>),
    WonElections(Result<Vec<String>, Infallible>),
    MustReportMaybeDead(Result<bool, Infallible>),

    AwaitTime(Result<oneshot::Receiver<()>, Infallible>),
    AwaitElection(Result<oneshot::Receiver<Identifier>, Infallible>),
    AwaitClosed(Result<oneshot::Receiver<()>, Infallible>),
    AwaitTerminated(Result<oneshot::Receiver<Identifier>, Infallible>),
    AwaitStop(Result<oneshot::Receiver<()>, Infallible>),

    Stop(Result<(), Infallible>),
}
