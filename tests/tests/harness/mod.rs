#![allow(dead_code)]

use std::time::{Duration, Instant};

use futures::executor::block_on;
use uuid::Uuid;

use pool_registry::executor::StdThread;
use pool_registry::prototyping::{DirectNetwork, PrototypingServer};
use pool_registry::{Capabilities, Config, EventHandler, Registry, RegistryBuilder};

pub type TestRegistry = Registry<DirectNetwork, StdThread>;

pub struct TestPool {
    pub network: DirectNetwork,
    pub server: PrototypingServer<DirectNetwork, StdThread>,
    pub name: String,
}

impl TestPool {
    pub fn start() -> Self {
        Self::start_on(DirectNetwork::new())
    }

    pub fn start_on(network: DirectNetwork) -> Self {
        init_tracing();

        let server = block_on(PrototypingServer::start_pushing_every(
            network.clone(),
            StdThread,
            Duration::from_millis(100),
        ))
        .unwrap();

        let name = format!("pool-{}", Uuid::new_v4());
        tracing::info!("Server for `{}` listens at {}.", name, server.address());

        Self {
            network,
            server,
            name,
        }
    }

    pub fn config(&self) -> Config {
        let capabilities = Capabilities::none()
            .with_elections()
            .with_signals()
            .with_membership()
            .with_termination();

        Config::new(&self.name, self.server.address())
            .with_capabilities(capabilities)
            .with_connect_timeout(Duration::from_secs(2))
            .with_event_push_interval(Duration::from_millis(200))
    }

    pub fn join(&self) -> TestRegistry {
        self.join_with(self.config())
    }

    pub fn join_with(&self, config: Config) -> TestRegistry {
        block_on(RegistryBuilder::new(config).join(self.network.clone(), StdThread)).unwrap()
    }

    pub fn join_handled(&self, handler: impl EventHandler) -> TestRegistry {
        let builder = RegistryBuilder::new(self.config()).with_event_handler(handler);

        block_on(builder.join(self.network.clone(), StdThread)).unwrap()
    }

    pub fn server_time(&self) -> u32 {
        block_on(self.server.time(&self.name)).unwrap_or(0)
    }

    pub fn heartbeats(&self) -> u64 {
        block_on(self.server.heartbeats(&self.name))
    }

    /// Members that bootstrapped from the server rather than from a peer.
    pub fn state_requests(&self) -> u64 {
        block_on(self.server.state_requests(&self.name))
    }
}

/// Polls `condition` until it holds, panicking after ten seconds.
pub fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);

    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }

        std::thread::sleep(Duration::from_millis(20));
    }
}

pub fn member_count(registry: &TestRegistry) -> usize {
    block_on(registry.members()).map_or(0, |m| m.len())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
