use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::Either;
use futures::lock::Mutex;
use futures::stream::StreamExt;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::error::IoError;
use crate::error::RegistryError;
use crate::event::Event;
use crate::event::EventKind;
use crate::event::Time;
use crate::executor::Executor;
use crate::identifier::Identifier;
use crate::member_set::MemberSetKind;
use crate::pool::state::PoolState;
use crate::transport::Transport;
use crate::wire::Connection;
use crate::wire::Magic;
use crate::wire::Opcode;
use crate::wire::NO_MINIMUM;

const BOOTSTRAP_CANDIDATES: usize = 4;

#[derive(Debug, Error)]
enum Refusal {
    #[error("unknown pool `{0}`")]
    UnknownPool(String),

    #[error("{0} is not a member")]
    NotAMember(Identifier),

    #[error("pool `{0}` is closed")]
    Closed(String),

    #[error("settings differ from those pool `{0}` was created with")]
    Settings(String),

    #[error("could not capture pool state")]
    State(#[from] IoError),
}

/// What the first member asked for when it created a pool. Later members must
/// ask for the same.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PoolSettings {
    peer_bootstrap: bool,
    gossip: bool,
    tree: bool,
    closed_world: bool,
    size: u32,
    purge_history: bool,
}

struct ServerPool {
    name: String,
    settings: PoolSettings,
    state: PoolState,
    next_id: u64,
    sequences: HashMap<String, i64>,
    tokens: HashMap<String, u32>,
    heartbeats: u64,
    state_requests: u64,
    /// Time every member had reached when the last push round completed.
    purgeable: Option<Time>,
    /// Members declared dead that still need to learn about it.
    farewells: Vec<Identifier>,
    nudger: mpsc::UnboundedSender<()>,
}

impl ServerPool {
    fn new(name: String, settings: PoolSettings) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (nudger, nudges) = mpsc::unbounded();
        let kind = if settings.tree {
            MemberSetKind::Tree
        } else {
            MemberSetKind::List
        };

        let pool = Self {
            name,
            settings,
            state: PoolState::new(kind),
            next_id: 0,
            sequences: HashMap::new(),
            tokens: HashMap::new(),
            heartbeats: 0,
            state_requests: 0,
            purgeable: None,
            farewells: Vec::new(),
            nudger,
        };

        (pool, nudges)
    }

    fn append(
        &mut self,
        kind: EventKind,
        description: Option<String>,
        ibises: impl IntoIterator<Item = Identifier>,
    ) -> Arc<Event> {
        let event = self.state.append(kind, description, ibises);

        trace!("Pool `{}` appended {}.", self.name, event);
        let _ = self.nudger.unbounded_send(());

        event
    }

    fn join(
        &mut self,
        address: String,
        data: Vec<u8>,
        location: String,
        settings: PoolSettings,
    ) -> Result<JoinReply, Refusal> {
        if self.settings != settings {
            return Err(Refusal::Settings(self.name.clone()));
        }

        if self.settings.closed_world && self.state.close_event().is_some() {
            return Err(Refusal::Closed(self.name.clone()));
        }

        let identifier = Identifier::new(self.next_id, self.name.clone(), address, location, data);
        self.next_id += 1;

        let join_time = self
            .append(EventKind::Join, None, [identifier.clone()])
            .time();

        info!("{} joined pool `{}` at time {}.", identifier, self.name, join_time);

        if self.settings.closed_world
            && self.state.close_event().is_none()
            && self.state.members().len() >= self.settings.size as usize
        {
            self.append(EventKind::PoolClosed, None, std::iter::empty());
            info!("Pool `{}` is complete and now closed.", self.name);
        }

        let bootstrap = if self.settings.peer_bootstrap {
            self.state
                .members()
                .random_members(BOOTSTRAP_CANDIDATES, Some(&identifier))
                .into_iter()
                .map(|m| m.identifier().clone())
                .collect()
        } else {
            Vec::new()
        };

        let snapshot = if bootstrap.is_empty() {
            Some(self.state.snapshot(join_time)?.encode())
        } else {
            None
        };

        Ok(JoinReply {
            identifier,
            join_time,
            minimum: self.state.log().minimum(),
            bootstrap,
            snapshot,
        })
    }

    fn elect(&mut self, candidate: &Identifier, name: String) -> Identifier {
        if let Some(election) = self.state.elections().get(&name) {
            return election.winner().clone();
        }

        self.append(EventKind::Elect, Some(name), [candidate.clone()]);

        candidate.clone()
    }

    fn next_in_sequence(&mut self, name: String) -> i64 {
        let next = self.sequences.entry(name).or_insert(0);
        let number = *next;
        *next += 1;

        number
    }

    fn add_tokens(&mut self, name: String, count: u32) {
        if count > 0 {
            let tokens = self.tokens.entry(name).or_insert(0);
            *tokens = tokens.saturating_add(count);
        }
    }

    fn take_token(&mut self, name: &str) -> bool {
        match self.tokens.get_mut(name) {
            Some(left) if *left > 0 => {
                *left -= 1;

                if *left == 0 {
                    self.tokens.remove(name);
                }

                true
            }
            _ => false,
        }
    }

    fn remove(&mut self, kind: EventKind, member: &Identifier) {
        if self.state.members().contains(member) {
            self.append(kind, None, [member.clone()]);

            if kind == EventKind::Died {
                self.farewells.push(member.clone());
            }
        }
    }

    fn terminate(&mut self, source: &Identifier) {
        if self.state.terminate_event().is_none() {
            self.append(EventKind::PoolTerminated, None, [source.clone()]);
        }
    }

    fn push_targets(&mut self) -> Vec<Identifier> {
        let members = self.state.members();

        let targets = if self.settings.tree {
            members.root_children()
        } else if self.settings.gossip {
            members.random_member(None).into_iter().collect()
        } else {
            members.members()
        };

        let mut targets = targets
            .into_iter()
            .map(|m| m.identifier().clone())
            .collect::<Vec<_>>();
        targets.append(&mut self.farewells);

        targets
    }
}

struct JoinReply {
    identifier: Identifier,
    join_time: Time,
    minimum: Time,
    bootstrap: Vec<Identifier>,
    snapshot: Option<Vec<u8>>,
}

/// An in-process server for any number of pools.
///
/// Events are pushed to members after every change and once per push interval.
/// Heartbeats are counted but not watched, members are only declared dead when
/// reported.
pub struct PrototypingServer<T: Transport, E: Executor> {
    inner: Arc<Inner<T, E>>,
}

struct Inner<T: Transport, E: Executor> {
    transport: T,
    executor: E,
    address: String,
    push_interval: Duration,
    connect_timeout: Duration,
    pools: Mutex<HashMap<String, ServerPool>>,
}

impl<T: Transport, E: Executor> Clone for PrototypingServer<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, E: Executor> PrototypingServer<T, E> {
    pub async fn start(transport: T, executor: E) -> Result<Self, RegistryError> {
        Self::start_pushing_every(transport, executor, Duration::from_secs(1)).await
    }

    /// Starts a server that pushes events to members at least once per
    /// `push_interval`.
    pub async fn start_pushing_every(
        transport: T,
        executor: E,
        push_interval: Duration,
    ) -> Result<Self, RegistryError> {
        let (address, listener) = transport
            .listen()
            .await
            .map_err(|e| IoError::new("listening for members", e))?;

        info!("Prototyping server listening at {}.", address);

        let server = Self {
            inner: Arc::new(Inner {
                transport,
                executor,
                address,
                push_interval,
                connect_timeout: Duration::from_secs(2),
                pools: Mutex::new(HashMap::new()),
            }),
        };

        server
            .inner
            .executor
            .execute(server.clone().accept(listener))
            .map_err(RegistryError::spawn)?;

        Ok(server)
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Current members of pool `name`, empty if there is no such pool.
    pub async fn members(&self, name: &str) -> Vec<Identifier> {
        self.inner
            .pools
            .lock()
            .await
            .get(name)
            .map(|p| {
                p.state
                    .members()
                    .members()
                    .into_iter()
                    .map(|m| m.identifier().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current time of pool `name`.
    pub async fn time(&self, name: &str) -> Option<Time> {
        self.inner
            .pools
            .lock()
            .await
            .get(name)
            .map(|p| p.state.time())
    }

    /// Heartbeats received from members of pool `name`.
    pub async fn heartbeats(&self, name: &str) -> u64 {
        self.inner
            .pools
            .lock()
            .await
            .get(name)
            .map_or(0, |p| p.heartbeats)
    }

    /// State requests members of pool `name` had to send because they could
    /// not bootstrap otherwise.
    pub async fn state_requests(&self, name: &str) -> u64 {
        self.inner
            .pools
            .lock()
            .await
            .get(name)
            .map_or(0, |p| p.state_requests)
    }

    async fn accept(self, mut listener: T::Listener) {
        while let Some(stream) = listener.next().await {
            match stream {
                Ok(stream) => {
                    let serving = self.clone().serve(stream);

                    if let Err(e) = self.inner.executor.execute(serving) {
                        warn!("Could not spawn connection handler: {}", e);
                    }
                }
                Err(e) => warn!("Could not accept connection: {}", e),
            }
        }

        debug!("Prototyping server stopped accepting connections.");
    }

    async fn serve(self, stream: T::Stream) {
        let mut conn = Connection::new(stream, "member");

        if let Err(e) = self.dispatch(&mut conn).await {
            debug!("Serving request failed: {}", e);
        }

        if let Err(e) = conn.close().await {
            trace!("Closing connection failed: {}", e);
        }
    }

    async fn dispatch(&self, conn: &mut Connection<T::Stream>) -> Result<(), RegistryError> {
        let magic = conn.read_u8().await?;

        if Magic::from_byte(magic) != Some(Magic::Server) {
            let message = format!("unexpected magic byte {}", magic);
            conn.write_error(&message);
            conn.flush().await?;

            return Err(RegistryError::Protocol(message));
        }

        let opcode = conn.read_u8().await?;

        match Opcode::from_byte(opcode) {
            Some(Opcode::Join) => self.handle_join(conn).await,
            Some(Opcode::Leave) => self.handle_removal(conn, EventKind::Leave).await,
            Some(Opcode::Elect) => self.handle_elect(conn).await,
            Some(Opcode::SequenceNr) => self.handle_sequence_nr(conn).await,
            Some(Opcode::Dead) => self.handle_dead(conn).await,
            Some(Opcode::MaybeDead) => self.handle_maybe_dead(conn).await,
            Some(Opcode::Signal) => self.handle_signal(conn).await,
            Some(Opcode::GetState) => self.handle_get_state(conn).await,
            Some(Opcode::Heartbeat) => self.handle_heartbeat(conn).await,
            Some(Opcode::Terminate) => self.handle_terminate(conn).await,
            Some(Opcode::AddTokens) => self.handle_add_tokens(conn).await,
            Some(Opcode::GetToken) => self.handle_get_token(conn).await,
            _ => {
                let message = format!("unexpected opcode {}", opcode);
                conn.write_error(&message);
                conn.flush().await?;

                Err(RegistryError::Protocol(message))
            }
        }
    }

    /// Runs `f` on the pool of `member`, provided it is a member.
    async fn with_member<R>(
        &self,
        member: &Identifier,
        f: impl FnOnce(&mut ServerPool) -> Result<R, Refusal>,
    ) -> Result<R, Refusal> {
        let mut pools = self.inner.pools.lock().await;

        let pool = pools
            .get_mut(member.pool())
            .ok_or_else(|| Refusal::UnknownPool(member.pool().to_owned()))?;

        if !pool.state.members().contains(member) {
            return Err(Refusal::NotAMember(member.clone()));
        }

        f(pool)
    }

    /// Forgets pools without members, which also ends their push loops.
    async fn prune(&self) {
        self.inner.pools.lock().await.retain(|name, pool| {
            let empty = pool.state.members().is_empty();

            if empty {
                info!("Pool `{}` is empty, forgetting it.", name);
            }

            !empty
        });
    }

    async fn handle_join(&self, conn: &mut Connection<T::Stream>) -> Result<(), RegistryError> {
        let address = conn.read_string().await?;
        let name = conn.read_string().await?;
        let data = conn.read_bytes().await?;
        let location = conn.read_string().await?;
        let peer_bootstrap = conn.read_bool().await?;
        let _heartbeat_interval = conn.read_u64().await?;
        let gossip = conn.read_bool().await?;
        let _gossip_interval = conn.read_u64().await?;
        let tree = conn.read_bool().await?;
        let closed_world = conn.read_bool().await?;
        let size = conn.read_u32().await?;
        let purge_history = conn.read_bool().await?;

        let settings = PoolSettings {
            peer_bootstrap,
            gossip,
            tree,
            closed_world,
            size,
            purge_history,
        };

        let (outcome, created) = {
            let mut pools = self.inner.pools.lock().await;

            let created = if pools.contains_key(&name) {
                None
            } else {
                let (pool, nudges) = ServerPool::new(name.clone(), settings);
                pools.insert(name.clone(), pool);
                Some(nudges)
            };

            let outcome = match pools.get_mut(&name) {
                Some(pool) => pool.join(address, data, location, settings),
                None => Err(Refusal::UnknownPool(name.clone())),
            };

            (outcome, created)
        };

        if let Some(nudges) = created {
            let pushing = self.clone().push_loop(name, nudges);

            self.inner
                .executor
                .execute(pushing)
                .map_err(RegistryError::spawn)?;
        }

        respond(conn, outcome, |conn, reply| {
            conn.write_identifier(&reply.identifier);
            conn.write_u32(reply.join_time);
            conn.write_u32(reply.minimum);
            conn.write_identifiers(reply.bootstrap.iter());

            match &reply.snapshot {
                Some(snapshot) => {
                    conn.write_bool(true);
                    conn.write_bytes(snapshot);
                }
                None => conn.write_bool(false),
            }
        })
        .await
    }

    async fn handle_removal(
        &self,
        conn: &mut Connection<T::Stream>,
        kind: EventKind,
    ) -> Result<(), RegistryError> {
        let member = conn.read_identifier().await?;

        let outcome = self
            .with_member(&member, |pool| {
                pool.remove(kind, &member);
                Ok(())
            })
            .await;

        self.prune().await;

        respond(conn, outcome, |_, ()| {}).await
    }

    async fn handle_elect(&self, conn: &mut Connection<T::Stream>) -> Result<(), RegistryError> {
        let candidate = conn.read_identifier().await?;
        let name = conn.read_string().await?;

        let outcome = self
            .with_member(&candidate, |pool| Ok(pool.elect(&candidate, name)))
            .await;

        respond(conn, outcome, |conn, winner| conn.write_identifier(&winner)).await
    }

    async fn handle_sequence_nr(
        &self,
        conn: &mut Connection<T::Stream>,
    ) -> Result<(), RegistryError> {
        let member = conn.read_identifier().await?;
        let name = conn.read_string().await?;

        let outcome = self
            .with_member(&member, |pool| Ok(pool.next_in_sequence(name)))
            .await;

        respond(conn, outcome, |conn, number| conn.write_i64(number)).await
    }

    async fn handle_dead(&self, conn: &mut Connection<T::Stream>) -> Result<(), RegistryError> {
        let reporter = conn.read_identifier().await?;
        let suspect = conn.read_identifier().await?;

        let outcome = self
            .with_member(&reporter, |pool| {
                pool.remove(EventKind::Died, &suspect);
                Ok(())
            })
            .await;

        self.prune().await;

        respond(conn, outcome, |_, ()| {}).await
    }

    async fn handle_maybe_dead(
        &self,
        conn: &mut Connection<T::Stream>,
    ) -> Result<(), RegistryError> {
        let reporter = conn.read_identifier().await?;
        let suspect = conn.read_identifier().await?;

        let outcome = self
            .with_member(&reporter, |pool| {
                Ok(pool.state.members().contains(&suspect))
            })
            .await;
        let check = matches!(outcome, Ok(true));

        respond(conn, outcome, |_, _| {}).await?;

        if check && !self.ping(&suspect).await {
            info!("{} did not answer, declaring it dead.", suspect);

            let _ = self
                .with_member(&reporter, |pool| {
                    pool.remove(EventKind::Died, &suspect);
                    Ok(())
                })
                .await;

            self.prune().await;
        }

        Ok(())
    }

    async fn handle_signal(&self, conn: &mut Connection<T::Stream>) -> Result<(), RegistryError> {
        let source = conn.read_identifier().await?;
        let signal = conn.read_string().await?;
        let targets = conn.read_identifiers().await?;

        let outcome = self
            .with_member(&source, |pool| {
                let ibises = std::iter::once(source.clone()).chain(targets);
                pool.append(EventKind::Signal, Some(signal), ibises);
                Ok(())
            })
            .await;

        respond(conn, outcome, |_, ()| {}).await
    }

    async fn handle_get_state(
        &self,
        conn: &mut Connection<T::Stream>,
    ) -> Result<(), RegistryError> {
        let member = conn.read_identifier().await?;
        let join_time = conn.read_u32().await?;

        let outcome = self
            .with_member(&member, |pool| {
                pool.state_requests += 1;
                Ok(pool.state.snapshot(join_time)?.encode())
            })
            .await;

        respond(conn, outcome, |conn, snapshot| conn.write_bytes(&snapshot)).await
    }

    async fn handle_heartbeat(
        &self,
        conn: &mut Connection<T::Stream>,
    ) -> Result<(), RegistryError> {
        let member = conn.read_identifier().await?;

        let outcome = self
            .with_member(&member, |pool| {
                pool.heartbeats += 1;
                Ok(())
            })
            .await;

        if outcome.is_ok() {
            trace!("Heartbeat from {}.", member);
        }

        respond(conn, outcome, |_, ()| {}).await
    }

    async fn handle_terminate(
        &self,
        conn: &mut Connection<T::Stream>,
    ) -> Result<(), RegistryError> {
        let member = conn.read_identifier().await?;

        let outcome = self
            .with_member(&member, |pool| {
                pool.terminate(&member);
                Ok(())
            })
            .await;

        respond(conn, outcome, |_, ()| {}).await
    }

    async fn handle_add_tokens(
        &self,
        conn: &mut Connection<T::Stream>,
    ) -> Result<(), RegistryError> {
        let member = conn.read_identifier().await?;
        let name = conn.read_string().await?;
        let count = conn.read_u32().await?;

        let outcome = self
            .with_member(&member, |pool| {
                pool.add_tokens(name, count);
                Ok(())
            })
            .await;

        respond(conn, outcome, |_, ()| {}).await
    }

    async fn handle_get_token(
        &self,
        conn: &mut Connection<T::Stream>,
    ) -> Result<(), RegistryError> {
        let member = conn.read_identifier().await?;
        let name = conn.read_string().await?;

        let outcome = self
            .with_member(&member, |pool| Ok(pool.take_token(&name)))
            .await;

        respond(conn, outcome, |conn, granted| conn.write_bool(granted)).await
    }

    /// Fails once the connect timeout has passed.
    async fn within_timeout<R>(
        &self,
        target: &Identifier,
        exchange: impl Future<Output = Result<R, RegistryError>>,
    ) -> Result<R, RegistryError> {
        match crate::util::with_timeout(exchange, Some(self.inner.connect_timeout)).await {
            Some(result) => result,
            None => Err(IoError::timed_out(format!("exchange with {}", target)).into()),
        }
    }

    async fn ping(&self, suspect: &Identifier) -> bool {
        let answer = self
            .within_timeout(suspect, async {
                let mut conn = crate::transport::connect(
                    &self.inner.transport,
                    suspect.address(),
                    self.inner.connect_timeout,
                )
                .await?;

                conn.write_header(Magic::Peer, Opcode::Ping);
                conn.flush().await?;
                conn.check_reply().await?;

                let identifier = conn.read_identifier().await?;
                conn.close().await?;

                Ok::<_, RegistryError>(identifier)
            })
            .await;

        match answer {
            Ok(identifier) => identifier == *suspect,
            Err(e) => {
                debug!("Pinging {} failed: {}", suspect, e);
                false
            }
        }
    }

    async fn push_loop(self, name: String, mut nudges: mpsc::UnboundedReceiver<()>) {
        loop {
            let tick = futures_timer::Delay::new(self.inner.push_interval);

            if let Either::Left((None, _)) = futures::future::select(nudges.next(), tick).await {
                break;
            }

            // one round serves any number of changes
            while let Ok(Some(())) = nudges.try_next() {}

            self.push_round(&name).await;
        }

        debug!("Stopped pushing to pool `{}`.", name);
    }

    async fn push_round(&self, name: &str) {
        let (targets, time, settings) = {
            let mut pools = self.inner.pools.lock().await;

            match pools.get_mut(name) {
                Some(pool) => (pool.push_targets(), pool.state.time(), pool.settings),
                None => return,
            }
        };

        let mut complete = true;

        for target in &targets {
            if let Err(e) = self.within_timeout(target, self.push(name, target)).await {
                debug!("Pushing to {} failed: {}", target, e);
                complete = false;
            }
        }

        if complete && settings.purge_history && !settings.tree && !settings.gossip {
            if let Some(pool) = self.inner.pools.lock().await.get_mut(name) {
                pool.state.log_mut().purge_below(pool.purgeable.unwrap_or(0));
                pool.purgeable = Some(time);
            }
        }
    }

    async fn push(&self, name: &str, target: &Identifier) -> Result<(), RegistryError> {
        let mut conn = crate::transport::connect(
            &self.inner.transport,
            target.address(),
            self.inner.connect_timeout,
        )
        .await?;

        conn.write_header(Magic::Peer, Opcode::Push);
        conn.write_str(name);
        conn.flush().await?;
        conn.check_reply().await?;

        let wants_snapshot = conn.read_bool().await?;
        let join_time = conn.read_u32().await?;
        let requested = conn.read_u32().await?;

        let (snapshot, events, minimum) = {
            let pools = self.inner.pools.lock().await;
            let pool = pools
                .get(name)
                .ok_or_else(|| RegistryError::protocol(format!("pool `{}` is gone", name)))?;

            let snapshot = if wants_snapshot {
                Some(pool.state.snapshot(join_time)?.encode())
            } else {
                None
            };
            let events = pool.state.log().contiguous_from(requested);
            let minimum = pool
                .purgeable
                .and_then(|t| i32::try_from(t).ok())
                .unwrap_or(NO_MINIMUM);

            (snapshot, events, minimum)
        };

        if let Some(snapshot) = snapshot {
            conn.write_bytes(&snapshot);
        }

        trace!("Pushing {} events to {}.", events.len(), target);

        conn.write_events(&events);
        conn.write_i32(minimum);
        conn.close().await
    }
}

/// Replies with OK and whatever `write_reply` writes, or with the refusal.
async fn respond<S, R>(
    conn: &mut Connection<S>,
    outcome: Result<R, Refusal>,
    write_reply: impl FnOnce(&mut Connection<S>, R),
) -> Result<(), RegistryError>
where
    S: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin,
{
    match outcome {
        Ok(reply) => {
            conn.write_ok();
            write_reply(conn, reply);
        }
        Err(refusal) => {
            debug!("Refusing request from {}: {}", conn.peer(), refusal);
            conn.write_error(&refusal.to_string());
        }
    }

    conn.flush().await
}
