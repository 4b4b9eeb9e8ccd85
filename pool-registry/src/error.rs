use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error")]
    Io(#[from] IoError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("remote side replied with an error: {0}")]
    Remote(String),

    #[error("invalid configuration")]
    Configuration(#[from] ConfigError),

    #[error("registry is stopped")]
    Stopped,

    #[error("task could not be spawned")]
    Spawn(#[source] BoxError),
}

impl RegistryError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub(crate) fn spawn(err: impl Into<BoxError>) -> Self {
        Self::Spawn(err.into())
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct IoError(String, #[source] std::io::Error);

impl IoError {
    pub(crate) fn new(context: impl Into<String>, source: std::io::Error) -> Self {
        Self(context.into(), source)
    }

    pub(crate) fn invalid_data(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::new(
            context,
            std::io::Error::new(std::io::ErrorKind::InvalidData, source),
        )
    }

    pub(crate) fn timed_out(context: impl Into<String>) -> Self {
        Self::new(
            context,
            std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
        )
    }

    pub fn kind(&self) -> std::io::ErrorKind {
        self.1.kind()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing property `{0}`")]
    Missing(&'static str),

    #[error("invalid value `{value}` for property `{key}`")]
    Invalid { key: &'static str, value: String },

    #[error("gossip and tree dissemination are mutually exclusive")]
    GossipAndTree,

    #[error("peer bootstrap must be {required} when `{because}` is set")]
    PeerBootstrap {
        required: &'static str,
        because: &'static str,
    },

    #[error("a closed world pool needs a positive size")]
    MissingPoolSize,

    #[error("capability `{0}` was not requested")]
    MissingCapability(&'static str),

    #[error("no event handler was installed")]
    NoEventHandler,

    #[error("downcalls are only available without an event handler")]
    HandlerInstalled,
}

/// The pool has been stopped, either explicitly or because the member was
/// declared dead.
#[derive(Clone, Copy, Debug, Error)]
#[error("pool is stopped")]
pub struct Stopped;

impl From<Stopped> for RegistryError {
    fn from(_: Stopped) -> Self {
        RegistryError::Stopped
    }
}

impl From<std::convert::Infallible> for Stopped {
    fn from(e: std::convert::Infallible) -> Self {
        match e {}
    }
}
