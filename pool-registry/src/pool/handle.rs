use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::channel::oneshot;
use futures::sink::SinkExt;

use crate::error::RegistryError;
use crate::error::Stopped;
use crate::event::Event;
use crate::event::Time;
use crate::identifier::Identifier;
use crate::snapshot::PoolSnapshot;

use super::msg::Request;
use super::msg::Response;
use super::PoolStatus;

/// Sends `Request::$name` to the pool and unpacks the matching response.
macro_rules! dispatch_pool_req {
    ($self:ident, $name:ident $(, $args:tt)?) => {{
        let dispatched = $self.dispatch(Request::$name $($args)?);

        async move {
            match dispatched.await? {
                Response::$name(r) => Ok(r?),
                _ => unreachable!("pool answered {} with another response", stringify!($name)),
            }
        }
    }};
}

#[derive(Clone, Debug)]
pub(crate) struct PoolHandle {
    sender: mpsc::Sender<super::RequestAndResponseSender>,
}

impl PoolHandle {
    pub(super) fn new(sender: mpsc::Sender<super::RequestAndResponseSender>) -> Self {
        Self { sender }
    }

    fn dispatch(&self, request: Request) -> impl Future<Output = Result<Response, Stopped>> {
        let (s, r) = oneshot::channel();
        let mut sender = self.sender.clone();

        async move {
            sender.send((request, s)).await.map_err(|_| Stopped)?;
            r.await.map_err(|_| Stopped)
        }
    }

    pub fn identify(&self, identifier: Identifier) -> impl Future<Output = Result<(), Stopped>> {
        dispatch_pool_req!(self, Identify, { identifier })
    }

    /// Initializes the pool from `snapshot`, returns `false` if it already was
    /// initialized.
    pub fn init(
        &self,
        snapshot: PoolSnapshot,
    ) -> impl Future<Output = Result<bool, RegistryError>> {
        dispatch_pool_req!(self, Init, { snapshot })
    }

    pub fn new_events(&self, events: Vec<Arc<Event>>) -> impl Future<Output = Result<(), Stopped>> {
        dispatch_pool_req!(self, NewEvents, { events })
    }

    pub fn purge_history_up_to(&self, time: Time) -> impl Future<Output = Result<(), Stopped>> {
        dispatch_pool_req!(self, PurgeHistoryUpTo, { time })
    }

    pub fn status(&self) -> impl Future<Output = Result<PoolStatus, Stopped>> {
        dispatch_pool_req!(self, Status)
    }

    pub fn events_from(
        &self,
        start: Time,
    ) -> impl Future<Output = Result<Vec<Arc<Event>>, Stopped>> {
        dispatch_pool_req!(self, EventsFrom, { start })
    }

    pub fn next_required_event(&self) -> impl Future<Output = Result<Time, Stopped>> {
        dispatch_pool_req!(self, NextRequiredEvent)
    }

    /// `None` while the pool is not initialized.
    pub fn prepare_snapshot(
        &self,
        signals_since: Time,
    ) -> impl Future<Output = Result<Option<PoolSnapshot>, RegistryError>> {
        dispatch_pool_req!(self, PrepareSnapshot, { signals_since })
    }

    /// Some member other than this one.
    pub fn random_peer(&self) -> impl Future<Output = Result<Option<Identifier>, Stopped>> {
        dispatch_pool_req!(self, RandomMember, { exclude_self: true })
    }

    pub fn random_member(&self) -> impl Future<Output = Result<Option<Identifier>, Stopped>> {
        dispatch_pool_req!(self, RandomMember, { exclude_self: false })
    }

    pub fn children(&self) -> impl Future<Output = Result<Vec<Identifier>, Stopped>> {
        dispatch_pool_req!(self, Children)
    }

    pub fn members(&self) -> impl Future<Output = Result<Vec<Identifier>, Stopped>> {
        dispatch_pool_req!(self, Members)
    }

    pub fn is_member(&self, identifier: Identifier) -> impl Future<Output = Result<bool, Stopped>> {
        dispatch_pool_req!(self, IsMember, { identifier })
    }

    pub fn election_result(
        &self,
        name: String,
    ) -> impl Future<Output = Result<Option<Identifier>, Stopped>> {
        dispatch_pool_req!(self, ElectionResult, { name })
    }

    pub fn won_elections(&self) -> impl Future<Output = Result<Vec<String>, Stopped>> {
        dispatch_pool_req!(self, WonElections)
    }

    pub fn must_report_maybe_dead(
        &self,
        identifier: Identifier,
    ) -> impl Future<Output = Result<bool, Stopped>> {
        dispatch_pool_req!(self, MustReportMaybeDead, { identifier })
    }

    pub fn stop(&self) -> impl Future<Output = Result<(), Stopped>> {
        dispatch_pool_req!(self, Stop)
    }

    fn await_time(
        &self,
        time: Time,
    ) -> impl Future<Output = Result<oneshot::Receiver<()>, Stopped>> {
        dispatch_pool_req!(self, AwaitTime, { time })
    }

    fn await_election(
        &self,
        name: String,
    ) -> impl Future<Output = Result<oneshot::Receiver<Identifier>, Stopped>> {
        dispatch_pool_req!(self, AwaitElection, { name })
    }

    fn await_closed(&self) -> impl Future<Output = Result<oneshot::Receiver<()>, Stopped>> {
        dispatch_pool_req!(self, AwaitClosed)
    }

    fn await_terminated(
        &self,
    ) -> impl Future<Output = Result<oneshot::Receiver<Identifier>, Stopped>> {
        dispatch_pool_req!(self, AwaitTerminated)
    }

    fn await_stop(&self) -> impl Future<Output = Result<oneshot::Receiver<()>, Stopped>> {
        dispatch_pool_req!(self, AwaitStop)
    }

    /// Waits until all events before `time` have been applied. Returns `false`
    /// on timeout.
    pub async fn wait_for_event_time(
        &self,
        time: Time,
        timeout: Option<Duration>,
    ) -> Result<bool, Stopped> {
        let awaited = self.await_time(time).await?;

        match crate::util::with_timeout(awaited, timeout).await {
            Some(r) => r.map(|()| true).map_err(|_| Stopped),
            None => Ok(false),
        }
    }

    /// Waits for the winner of election `name`. Returns `None` on timeout.
    pub async fn get_election_result(
        &self,
        name: String,
        timeout: Option<Duration>,
    ) -> Result<Option<Identifier>, Stopped> {
        let awaited = self.await_election(name).await?;

        match crate::util::with_timeout(awaited, timeout).await {
            Some(r) => r.map(Some).map_err(|_| Stopped),
            None => Ok(None),
        }
    }

    pub async fn wait_until_closed(&self) -> Result<(), Stopped> {
        let awaited = self.await_closed().await?;

        awaited.await.map_err(|_| Stopped)
    }

    /// Waits for the pool to be terminated, resolving to the member that
    /// terminated it. Returns `None` on timeout.
    pub async fn wait_until_terminated(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Identifier>, Stopped> {
        let awaited = self.await_terminated().await?;

        match crate::util::with_timeout(awaited, timeout).await {
            Some(r) => r.map(Some).map_err(|_| Stopped),
            None => Ok(None),
        }
    }

    /// Resolves once the pool has stopped.
    pub async fn stopped(&self) {
        if let Ok(awaited) = self.await_stop().await {
            let _ = awaited.await;
        }
    }

    pub async fn is_stopped(&self) -> bool {
        self.status().await.map(|s| s.stopped).unwrap_or(true)
    }
}
