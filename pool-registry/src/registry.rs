//! The application's view of a pool.
//!
//! A [`Registry`] is obtained by joining a pool through a [`RegistryBuilder`].
//! It owns nothing but handles; the pool actor and the background loops run
//! on the executor passed to [`RegistryBuilder::join`].

use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::lock::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::communication::CommunicationHandler;
use crate::config::Config;
use crate::error::ConfigError;
use crate::error::IoError;
use crate::error::RegistryError;
use crate::event::Time;
use crate::executor::Executor;
use crate::heartbeat::Heartbeat;
use crate::identifier::Identifier;
use crate::pool::Pool;
use crate::pool::PoolKit;
use crate::transport::Transport;
use crate::upcaller::Downcalls;
use crate::upcaller::EventHandler;
use crate::upcaller::Sink;
use crate::upcaller::Upcaller;

pub struct RegistryBuilder {
    config: Config,
    handler: Option<Arc<dyn EventHandler>>,
    data: Vec<u8>,
}

impl RegistryBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            handler: None,
            data: Vec::new(),
        }
    }

    /// Installs `handler` for pool events. Callbacks only start once
    /// [`Registry::enable_events`] is called.
    pub fn with_event_handler(mut self, handler: impl EventHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Opaque data other members find in this member's [`Identifier`].
    pub fn with_implementation_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Joins the pool, returning once the local pool state is initialized.
    pub async fn join<T: Transport, E: Executor>(
        self,
        transport: T,
        executor: E,
    ) -> Result<Registry<T, E>, RegistryError> {
        self.config.validate()?;

        let config = Arc::new(self.config);

        let (emitter, deliveries) = mpsc::unbounded();
        let pool = Pool::spawn(
            PoolKit::new(),
            config.pool_name().to_owned(),
            config.member_set_kind(),
            config.heartbeat_interval(),
            emitter,
            &executor,
        )?;

        let handler_installed = self.handler.is_some();
        let downcalls = Arc::new(Mutex::new(Downcalls::default()));
        let sink = match self.handler {
            Some(handler) => Sink::Handler(handler),
            None if config.capabilities().membership => Sink::Downcalls(Arc::clone(&downcalls)),
            None => Sink::Discard,
        };
        let upcaller = Upcaller::spawn(sink, deliveries, &executor)?;

        let (address, listener) = transport
            .listen()
            .await
            .map_err(|e| IoError::new("listening for peers", e))?;

        let (heartbeat, nudges) =
            Heartbeat::new(config.heartbeat_interval(), config.heartbeat_jitter());

        let comm = CommunicationHandler::new(
            Arc::clone(&config),
            transport,
            executor.clone(),
            pool.clone(),
            address,
            Arc::clone(&heartbeat),
        );

        let accepting = crate::communication::inbound::accept(comm.clone(), listener);

        if let Err(e) = executor.execute(accepting) {
            let _ = pool.stop().await;
            return Err(RegistryError::spawn(e));
        }

        let identifier = match comm.join(self.data).await {
            Ok(identifier) => identifier,
            Err(e) => {
                let _ = pool.stop().await;
                return Err(e);
            }
        };

        if let Err(e) = comm.bootstrap().await {
            warn!("Could not bootstrap pool `{}`: {}", config.pool_name(), e);

            if let Err(e) = comm.leave().await {
                debug!("Leaving after failed bootstrap failed as well: {}", e);
            }

            return Err(e);
        }

        let registry = Registry {
            config: Arc::clone(&config),
            comm: comm.clone(),
            identifier,
            upcaller,
            downcalls,
            handler_installed,
        };

        let loops = async {
            executor
                .execute(crate::heartbeat::run(comm.clone(), heartbeat, nudges))
                .map_err(RegistryError::spawn)?;

            if config.gossip() {
                executor
                    .execute(crate::gossiper::run(comm.clone()))
                    .map_err(RegistryError::spawn)?;
            }

            if config.tree() {
                executor
                    .execute(crate::pusher::run(comm.clone()))
                    .map_err(RegistryError::spawn)?;
            }

            Ok::<_, RegistryError>(())
        };

        if let Err(e) = loops.await {
            let _ = registry.comm.leave().await;
            return Err(e);
        }

        let status = registry.comm.pool().status().await?;
        info!(
            "{} is a member of pool `{}` at time {} with {} members.",
            registry.identifier,
            config.pool_name(),
            status.time,
            status.size
        );

        Ok(registry)
    }
}

/// A member's handle on its pool.
///
/// All queries are answered from local state, which lags behind the server by
/// however long dissemination takes. Once the member has left or was declared
/// dead, every operation fails with [`RegistryError::Stopped`].
pub struct Registry<T: Transport, E: Executor> {
    config: Arc<Config>,
    comm: CommunicationHandler<T, E>,
    identifier: Identifier,
    upcaller: Upcaller,
    downcalls: Arc<Mutex<Downcalls>>,
    handler_installed: bool,
}

impl<T: Transport, E: Executor> Registry<T, E> {
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn pool_name(&self) -> &str {
        self.config.pool_name()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn require(&self, granted: bool, capability: &'static str) -> Result<(), RegistryError> {
        if granted {
            Ok(())
        } else {
            Err(ConfigError::MissingCapability(capability).into())
        }
    }

    fn require_elections(&self) -> Result<(), RegistryError> {
        self.require(self.config.capabilities().elections, "elections")
    }

    fn require_signals(&self) -> Result<(), RegistryError> {
        self.require(self.config.capabilities().signals, "signals")
    }

    fn require_membership(&self) -> Result<(), RegistryError> {
        self.require(self.config.capabilities().membership, "membership")
    }

    fn require_closed_world(&self) -> Result<(), RegistryError> {
        self.require(self.config.capabilities().closed_world, "closed world")
    }

    fn require_termination(&self) -> Result<(), RegistryError> {
        self.require(self.config.capabilities().termination, "termination")
    }

    fn require_handler(&self) -> Result<(), RegistryError> {
        if self.handler_installed {
            Ok(())
        } else {
            Err(ConfigError::NoEventHandler.into())
        }
    }

    fn require_downcalls(&self) -> Result<(), RegistryError> {
        self.require_membership()?;

        if self.handler_installed {
            Err(ConfigError::HandlerInstalled.into())
        } else {
            Ok(())
        }
    }

    async fn ensure_running(&self) -> Result<(), RegistryError> {
        if self.comm.pool().is_stopped().await {
            Err(RegistryError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Number of events applied locally so far.
    pub async fn time(&self) -> Result<Time, RegistryError> {
        Ok(self.comm.pool().status().await?.time)
    }

    /// Size of the closed world pool.
    pub fn pool_size(&self) -> Result<u32, RegistryError> {
        self.require_closed_world()?;

        self.config
            .pool_size()
            .ok_or_else(|| ConfigError::MissingPoolSize.into())
    }

    /// Current members, including this one.
    pub async fn members(&self) -> Result<Vec<Identifier>, RegistryError> {
        self.require_membership()?;
        self.ensure_running().await?;

        Ok(self.comm.pool().members().await?)
    }

    pub async fn is_member(&self, identifier: &Identifier) -> Result<bool, RegistryError> {
        self.require_membership()?;
        self.ensure_running().await?;

        Ok(self.comm.pool().is_member(identifier.clone()).await?)
    }

    /// A member picked at random, possibly this one.
    pub async fn random_pool_member(&self) -> Result<Option<Identifier>, RegistryError> {
        self.require_membership()?;
        self.ensure_running().await?;

        Ok(self.comm.pool().random_member().await?)
    }

    /// Runs for election `name`, resolving to its winner. Elections that were
    /// already decided locally are not sent to the server again.
    pub async fn elect(&self, name: &str) -> Result<Identifier, RegistryError> {
        self.require_elections()?;
        self.ensure_running().await?;

        if let Some(winner) = self.comm.pool().election_result(name.to_owned()).await? {
            debug!("Election `{}` already won by {}.", name, winner);
            return Ok(winner);
        }

        self.comm.elect(name).await
    }

    /// Winner of election `name`, waiting for it at most `timeout`. Resolves
    /// to `None` if no winner is known by then.
    pub async fn get_election_result(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Identifier>, RegistryError> {
        self.require_elections()?;

        Ok(self
            .comm
            .pool()
            .get_election_result(name.to_owned(), timeout)
            .await?)
    }

    /// Names of the elections this member won.
    pub async fn won_elections(&self) -> Result<Vec<String>, RegistryError> {
        self.require_elections()?;
        self.ensure_running().await?;

        Ok(self.comm.pool().won_elections().await?)
    }

    pub async fn signal(&self, signal: &str, targets: &[Identifier]) -> Result<(), RegistryError> {
        self.require_signals()?;
        self.ensure_running().await?;

        self.comm.signal(signal, targets).await
    }

    /// Declares `suspect` dead without further checks.
    pub async fn assume_dead(&self, suspect: &Identifier) -> Result<(), RegistryError> {
        self.require_membership()?;
        self.ensure_running().await?;

        self.comm.assume_dead(suspect).await
    }

    /// Asks the server to check on `suspect`.
    pub async fn maybe_dead(&self, suspect: &Identifier) -> Result<(), RegistryError> {
        self.require_membership()?;
        self.ensure_running().await?;

        self.comm.maybe_dead(suspect).await
    }

    /// Next number of the pool wide sequence `name`.
    pub async fn sequence_number(&self, name: &str) -> Result<i64, RegistryError> {
        self.ensure_running().await?;

        self.comm.sequence_number(name).await
    }

    /// Hands `count` more tokens called `name` to the server.
    pub async fn add_tokens(&self, name: &str, count: u32) -> Result<(), RegistryError> {
        self.ensure_running().await?;

        self.comm.add_tokens(name, count).await
    }

    /// Takes one token called `name` from the server. Resolves to `false` once
    /// all of them have been taken.
    pub async fn get_token(&self, name: &str) -> Result<bool, RegistryError> {
        self.ensure_running().await?;

        self.comm.get_token(name).await
    }

    /// Leaves the pool. Local state is stopped even if the server could not
    /// be told.
    pub async fn leave(&self) -> Result<(), RegistryError> {
        self.ensure_running().await?;

        info!("{} leaving pool `{}`.", self.identifier, self.pool_name());

        self.comm.leave().await
    }

    pub async fn terminate(&self) -> Result<(), RegistryError> {
        self.require_termination()?;
        self.ensure_running().await?;

        self.comm.terminate().await
    }

    pub async fn has_terminated(&self) -> Result<bool, RegistryError> {
        self.require_termination()?;

        Ok(self.comm.pool().status().await?.terminated)
    }

    /// Waits for the pool to be terminated, at most `timeout`. Resolves to the
    /// member that terminated it, or `None` on timeout.
    pub async fn wait_until_terminated(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Identifier>, RegistryError> {
        self.require_termination()?;

        Ok(self.comm.pool().wait_until_terminated(timeout).await?)
    }

    /// Whether all members of the closed world have joined.
    pub async fn is_closed(&self) -> Result<bool, RegistryError> {
        self.require_closed_world()?;

        Ok(self.comm.pool().status().await?.closed)
    }

    pub async fn wait_until_pool_closed(&self) -> Result<(), RegistryError> {
        self.require_closed_world()?;

        Ok(self.comm.pool().wait_until_closed().await?)
    }

    pub async fn enable_events(&self) -> Result<(), RegistryError> {
        self.require_handler()?;

        self.upcaller.enable_events().await;

        Ok(())
    }

    /// Stops event callbacks. Returns only once no callback is running.
    pub async fn disable_events(&self) -> Result<(), RegistryError> {
        self.require_handler()?;

        self.upcaller.disable_events().await;

        Ok(())
    }

    /// Members that joined since the last call.
    pub async fn joined_members(&self) -> Result<Vec<Identifier>, RegistryError> {
        self.require_downcalls()?;

        Ok(std::mem::take(&mut self.downcalls.lock().await.joined))
    }

    /// Members that left since the last call.
    pub async fn left_members(&self) -> Result<Vec<Identifier>, RegistryError> {
        self.require_downcalls()?;

        Ok(std::mem::take(&mut self.downcalls.lock().await.left))
    }

    /// Members that died since the last call.
    pub async fn died_members(&self) -> Result<Vec<Identifier>, RegistryError> {
        self.require_downcalls()?;

        Ok(std::mem::take(&mut self.downcalls.lock().await.died))
    }

    /// Signals received since the last call.
    pub async fn received_signals(&self) -> Result<Vec<String>, RegistryError> {
        self.require_signals()?;
        self.require_downcalls()?;

        Ok(std::mem::take(&mut self.downcalls.lock().await.signals))
    }
}
