//! A registry for pools of cooperating processes.
//!
//! Processes that work together on one job join a named _pool_. The registry
//! keeps every member informed about who else is in the pool, runs
//! single-winner _elections_, delivers _signals_ from one member to others and
//! lets members report each other as dead.
//!
//! # Model
//!
//! A central server assigns every fact that affects the pool a _time_: joins,
//! leaves, deaths, signals, elections, closing and termination of the pool.
//! Times start at zero and have no gaps, so each member can apply the events
//! of its pool strictly in order and is guaranteed to arrive at the same
//! state as every other member, no matter how the events reached it.
//!
//! Events reach members in one of three ways.
//!
//!  - The server pushes them to all members.
//!  - With [gossip][Config::with_gossip] enabled, members periodically pick a
//!    random peer and exchange whatever events one of them is missing.
//!  - With [tree dissemination][Config::with_tree] enabled, the server pushes
//!    to the root of a binary tree spanning all members and each member pushes
//!    on to its children.
//!
//! A joining member first needs the state of the pool as of its own join. It
//! asks the peers the server suggests and falls back to asking the server
//! itself.
//!
//! # Usage
//!
//! Build a [`Config`], hand it to a [`RegistryBuilder`] and join with a
//! [`Transport`] and an [`Executor`]. The `prototyping` feature provides an
//! in-memory transport and server for experiments and tests.
//!
//! Applications learn about pool events either by installing an
//! [`EventHandler`] or, without one, by polling
//! [`joined_members`][Registry::joined_members] and friends.

//
// Lint configuration
#![warn(rust_2018_idioms)]
#![warn(clippy::wildcard_imports)]

mod communication;
pub mod config;
pub mod election;
pub mod error;
pub mod event;
mod event_log;
pub mod executor;
mod gossiper;
mod heartbeat;
pub mod identifier;
pub mod member_set;
mod pool;
#[cfg(feature = "prototyping")]
pub mod prototyping;
mod pusher;
pub mod registry;
mod snapshot;
pub mod transport;
pub mod upcaller;
mod util;
mod wire;

pub use config::Capabilities;
pub use config::Config;
pub use error::ConfigError;
pub use error::RegistryError;
pub use event::Event;
pub use event::EventKind;
pub use event::Time;
pub use executor::Executor;
pub use identifier::Identifier;
pub use registry::Registry;
pub use registry::RegistryBuilder;
pub use transport::Transport;
pub use upcaller::EventHandler;
