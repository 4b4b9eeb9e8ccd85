//! Talking to the server and to peers.
//!
//! Every exchange opens its own connection, writes a request, reads a reply
//! that starts with a status and closes the connection again. An exchange
//! that takes longer than the connect timeout, from connecting to closing,
//! fails as timed out. The inbound side lives in [`inbound`].

pub(crate) mod inbound;

use std::future::Future;
use std::sync::Arc;

use futures::lock::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::error::IoError;
use crate::error::RegistryError;
use crate::event::Time;
use crate::executor::Executor;
use crate::heartbeat::Heartbeat;
use crate::identifier::Identifier;
use crate::pool::PoolHandle;
use crate::snapshot::PoolSnapshot;
use crate::transport::Transport;
use crate::wire::Connection;
use crate::wire::Magic;
use crate::wire::Opcode;
use crate::wire::NO_MINIMUM;

/// What the server told this member when it joined.
#[derive(Clone, Debug)]
pub(crate) struct Membership {
    pub identifier: Identifier,
    /// Time of this member's own join event.
    pub join_time: Time,
    pub bootstrap: Vec<Identifier>,
}

pub(crate) struct CommunicationHandler<T: Transport, E: Executor> {
    inner: Arc<Inner<T, E>>,
}

struct Inner<T: Transport, E: Executor> {
    config: Arc<Config>,
    transport: T,
    executor: E,
    pool: PoolHandle,
    address: String,
    heartbeat: Arc<Heartbeat>,
    membership: Mutex<Option<Membership>>,
}

impl<T: Transport, E: Executor> Clone for CommunicationHandler<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, E: Executor> CommunicationHandler<T, E> {
    pub fn new(
        config: Arc<Config>,
        transport: T,
        executor: E,
        pool: PoolHandle,
        address: String,
        heartbeat: Arc<Heartbeat>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                executor,
                pool,
                address,
                heartbeat,
                membership: Mutex::new(None),
            }),
        }
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.inner.pool
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn executor(&self) -> &E {
        &self.inner.executor
    }

    pub async fn membership(&self) -> Option<Membership> {
        self.inner.membership.lock().await.clone()
    }

    async fn identifier(&self) -> Result<Identifier, RegistryError> {
        self.membership()
            .await
            .map(|m| m.identifier)
            .ok_or_else(|| RegistryError::protocol("member has not joined yet"))
    }

    fn server(&self) -> &str {
        self.inner.config.server_address()
    }

    /// Runs `exchange` with `address` to completion or fails once the connect
    /// timeout has passed, whichever comes first.
    async fn exchange<R>(
        &self,
        address: &str,
        exchange: impl Future<Output = Result<R, RegistryError>>,
    ) -> Result<R, RegistryError> {
        let timeout = self.inner.config.connect_timeout();

        match crate::util::with_timeout(exchange, Some(timeout)).await {
            Some(result) => result,
            None => Err(IoError::timed_out(format!("exchange with {}", address)).into()),
        }
    }

    async fn connect(
        &self,
        address: &str,
        magic: Magic,
        opcode: Opcode,
    ) -> Result<Connection<T::Stream>, RegistryError> {
        let mut conn = crate::transport::connect(
            &self.inner.transport,
            address,
            self.inner.config.connect_timeout(),
        )
        .await?;

        conn.write_header(magic, opcode);

        Ok(conn)
    }

    /// Sends a request to the server and checks the reply's status. The rest of
    /// the reply is left for the caller to read.
    async fn call_server(
        &self,
        opcode: Opcode,
        write_request: impl FnOnce(&mut Connection<T::Stream>),
    ) -> Result<Connection<T::Stream>, RegistryError> {
        let mut conn = self.connect(self.server(), Magic::Server, opcode).await?;

        write_request(&mut conn);
        conn.flush().await?;
        conn.check_reply().await?;

        self.inner.heartbeat.reset().await;

        Ok(conn)
    }

    /// A request whose reply carries nothing but the status.
    async fn notify_server(
        &self,
        opcode: Opcode,
        write_request: impl FnOnce(&mut Connection<T::Stream>),
    ) -> Result<(), RegistryError> {
        self.exchange(self.server(), async {
            self.call_server(opcode, write_request).await?.close().await
        })
        .await
    }

    pub async fn join(&self, data: Vec<u8>) -> Result<Identifier, RegistryError> {
        let config = Arc::clone(&self.inner.config);

        let (identifier, join_time, minimum_time, bootstrap, snapshot) = self
            .exchange(self.server(), async {
                let mut conn = self
                    .call_server(Opcode::Join, |conn| {
                        conn.write_str(&self.inner.address);
                        conn.write_str(config.pool_name());
                        conn.write_bytes(&data);
                        conn.write_str(config.location());
                        conn.write_bool(config.peer_bootstrap());
                        conn.write_u64(config.heartbeat_interval().as_millis() as u64);
                        conn.write_bool(config.gossip());
                        conn.write_u64(config.gossip_interval().as_millis() as u64);
                        conn.write_bool(config.tree());
                        conn.write_bool(config.capabilities().closed_world);
                        conn.write_u32(config.pool_size().unwrap_or(0));
                        conn.write_bool(config.purge_history());
                    })
                    .await?;

                let identifier = conn.read_identifier().await?;
                let join_time = conn.read_u32().await?;
                let minimum_time = conn.read_u32().await?;
                let bootstrap = conn.read_identifiers().await?;
                let snapshot = if conn.read_bool().await? {
                    Some(PoolSnapshot::decode(conn.read_bytes().await?).await?)
                } else {
                    None
                };

                conn.close().await?;

                Ok::<_, RegistryError>((identifier, join_time, minimum_time, bootstrap, snapshot))
            })
            .await?;

        info!(
            "Joined pool `{}` as {} at time {}.",
            config.pool_name(),
            identifier,
            join_time
        );

        *self.inner.membership.lock().await = Some(Membership {
            identifier: identifier.clone(),
            join_time,
            bootstrap,
        });

        let pool = self.pool();
        pool.identify(identifier.clone()).await?;
        pool.purge_history_up_to(minimum_time).await?;

        if let Some(snapshot) = snapshot {
            pool.init(snapshot).await?;
        }

        Ok(identifier)
    }

    /// Makes sure the pool is initialized.
    ///
    /// Bootstrap candidates are tried in turn, the server is the last resort.
    pub async fn bootstrap(&self) -> Result<(), RegistryError> {
        if self.pool().status().await?.initialized {
            return Ok(());
        }

        let membership = self
            .membership()
            .await
            .ok_or_else(|| RegistryError::protocol("member has not joined yet"))?;

        if self.inner.config.peer_bootstrap() {
            for peer in membership
                .bootstrap
                .iter()
                .filter(|p| **p != membership.identifier)
            {
                match self.bootstrap_from_peer(peer, &membership).await {
                    Ok(()) => {
                        debug!("Bootstrapped from {}.", peer);
                        return Ok(());
                    }
                    Err(e) => debug!("Could not bootstrap from {}: {}", peer, e),
                }
            }
        }

        self.bootstrap_from_server(&membership).await?;
        debug!("Bootstrapped from server.");

        Ok(())
    }

    async fn bootstrap_from_peer(
        &self,
        peer: &Identifier,
        membership: &Membership,
    ) -> Result<(), RegistryError> {
        let snapshot = self
            .exchange(peer.address(), async {
                let mut conn = self
                    .connect(peer.address(), Magic::Peer, Opcode::GetState)
                    .await?;

                conn.write_identifier(&membership.identifier);
                conn.write_u32(membership.join_time);
                conn.flush().await?;
                conn.check_reply().await?;

                let snapshot = PoolSnapshot::decode(conn.read_bytes().await?).await?;

                conn.close().await?;

                Ok::<_, RegistryError>(snapshot)
            })
            .await?;

        if snapshot.time() <= membership.join_time {
            return Err(RegistryError::protocol(format!(
                "stale snapshot at time {}, joined at {}",
                snapshot.time(),
                membership.join_time
            )));
        }

        self.pool().init(snapshot).await?;

        Ok(())
    }

    async fn bootstrap_from_server(&self, membership: &Membership) -> Result<(), RegistryError> {
        let snapshot = self
            .exchange(self.server(), async {
                let mut conn = self
                    .call_server(Opcode::GetState, |conn| {
                        conn.write_identifier(&membership.identifier);
                        conn.write_u32(membership.join_time);
                    })
                    .await?;

                let snapshot = PoolSnapshot::decode(conn.read_bytes().await?).await?;

                conn.close().await?;

                Ok::<_, RegistryError>(snapshot)
            })
            .await?;

        self.pool().init(snapshot).await?;

        Ok(())
    }

    /// Failures are logged, the next heartbeat is due soon enough.
    pub async fn send_heartbeat(&self) {
        let identifier = match self.identifier().await {
            Ok(identifier) => identifier,
            Err(_) => return,
        };

        let result = self
            .notify_server(Opcode::Heartbeat, |conn| conn.write_identifier(&identifier))
            .await;

        if let Err(e) = result {
            warn!("Could not send heartbeat: {}", e);
        }
    }

    /// Exchanges events with `peer` so that both end up at the same time.
    pub async fn gossip(&self, peer: &Identifier) -> Result<(), RegistryError> {
        let identifier = self.identifier().await?;

        if *peer == identifier {
            return Ok(());
        }

        let local_time = self.pool().status().await?.time;

        let received = self
            .exchange(peer.address(), async {
                let mut conn = self
                    .connect(peer.address(), Magic::Peer, Opcode::Gossip)
                    .await?;

                conn.write_identifier(&identifier);
                conn.write_u32(local_time);
                conn.flush().await?;
                conn.check_reply().await?;

                let peer_time = conn.read_u32().await?;

                let received = if peer_time > local_time {
                    conn.read_events().await?
                } else {
                    if peer_time < local_time {
                        conn.write_events(&self.pool().events_from(peer_time).await?);
                    }

                    Vec::new()
                };

                conn.close().await?;

                Ok::<_, RegistryError>(received)
            })
            .await?;

        if !received.is_empty() {
            debug!("Gossip with {} yielded {} events.", peer, received.len());
            self.pool().new_events(received).await?;
        }

        Ok(())
    }

    /// Pushes events `peer` is missing, along with a snapshot if it needs one.
    pub async fn forward(&self, peer: &Identifier) -> Result<(), RegistryError> {
        if !self.pool().status().await?.initialized {
            return Ok(());
        }

        self.exchange(peer.address(), async {
            let mut conn = self
                .connect(peer.address(), Magic::Peer, Opcode::Push)
                .await?;

            conn.write_str(self.inner.config.pool_name());
            conn.flush().await?;
            conn.check_reply().await?;

            let wants_snapshot = conn.read_bool().await?;
            let peer_join_time = conn.read_u32().await?;
            let requested = conn.read_u32().await?;

            if wants_snapshot {
                match self.pool().prepare_snapshot(peer_join_time).await? {
                    Some(snapshot) => conn.write_bytes(&snapshot.encode()),
                    None => return Err(RegistryError::protocol("no snapshot to forward")),
                }
            }

            let events = self.pool().events_from(requested).await?;
            conn.write_events(&events);
            conn.write_i32(NO_MINIMUM);
            conn.close().await
        })
        .await
    }

    pub async fn elect(&self, name: &str) -> Result<Identifier, RegistryError> {
        let identifier = self.identifier().await?;

        self.exchange(self.server(), async {
            let mut conn = self
                .call_server(Opcode::Elect, |conn| {
                    conn.write_identifier(&identifier);
                    conn.write_str(name);
                })
                .await?;

            let winner = conn.read_identifier().await?;
            conn.close().await?;

            Ok::<_, RegistryError>(winner)
        })
        .await
    }

    pub async fn sequence_number(&self, name: &str) -> Result<i64, RegistryError> {
        let identifier = self.identifier().await?;

        self.exchange(self.server(), async {
            let mut conn = self
                .call_server(Opcode::SequenceNr, |conn| {
                    conn.write_identifier(&identifier);
                    conn.write_str(name);
                })
                .await?;

            let number = conn.read_i64().await?;
            conn.close().await?;

            Ok::<_, RegistryError>(number)
        })
        .await
    }

    pub async fn add_tokens(&self, name: &str, count: u32) -> Result<(), RegistryError> {
        let identifier = self.identifier().await?;

        self.notify_server(Opcode::AddTokens, |conn| {
            conn.write_identifier(&identifier);
            conn.write_str(name);
            conn.write_u32(count);
        })
        .await
    }

    /// Takes one of the tokens called `name`, `false` if none are left.
    pub async fn get_token(&self, name: &str) -> Result<bool, RegistryError> {
        let identifier = self.identifier().await?;

        self.exchange(self.server(), async {
            let mut conn = self
                .call_server(Opcode::GetToken, |conn| {
                    conn.write_identifier(&identifier);
                    conn.write_str(name);
                })
                .await?;

            let granted = conn.read_bool().await?;
            conn.close().await?;

            Ok::<_, RegistryError>(granted)
        })
        .await
    }

    pub async fn signal(&self, signal: &str, targets: &[Identifier]) -> Result<(), RegistryError> {
        let identifier = self.identifier().await?;

        self.notify_server(Opcode::Signal, |conn| {
            conn.write_identifier(&identifier);
            conn.write_str(signal);
            conn.write_identifiers(targets.iter());
        })
        .await
    }

    pub async fn assume_dead(&self, suspect: &Identifier) -> Result<(), RegistryError> {
        let identifier = self.identifier().await?;

        self.notify_server(Opcode::Dead, |conn| {
            conn.write_identifier(&identifier);
            conn.write_identifier(suspect);
        })
        .await
    }

    /// Reports `suspect` to the server, at most once per heartbeat interval.
    pub async fn maybe_dead(&self, suspect: &Identifier) -> Result<(), RegistryError> {
        if !self.pool().must_report_maybe_dead(suspect.clone()).await? {
            debug!("Not reporting {} again so soon.", suspect);
            return Ok(());
        }

        let identifier = self.identifier().await?;

        self.notify_server(Opcode::MaybeDead, |conn| {
            conn.write_identifier(&identifier);
            conn.write_identifier(suspect);
        })
        .await
    }

    pub async fn terminate(&self) -> Result<(), RegistryError> {
        let identifier = self.identifier().await?;

        self.notify_server(Opcode::Terminate, |conn| conn.write_identifier(&identifier))
            .await
    }

    /// Leaves the pool. The local pool is stopped even if the server cannot be
    /// reached.
    pub async fn leave(&self) -> Result<(), RegistryError> {
        let result = match self.identifier().await {
            Ok(identifier) => {
                self.notify_server(Opcode::Leave, |conn| conn.write_identifier(&identifier))
                    .await
            }
            Err(e) => Err(e),
        };

        let _ = self.pool().stop().await;
        self.inner.heartbeat.nudge();

        result
    }
}
