use std::time::Duration;

use futures::future::BoxFuture;
use futures::future::FutureExt;
use futures::io::AsyncRead;
use futures::io::AsyncWrite;
use futures::stream::Stream;

use crate::error::IoError;
use crate::error::RegistryError;
use crate::wire::Connection;

/// Ordered byte streams between members and to the server.
pub trait Transport: Clone + Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Incoming connections.
    type Listener: Stream<Item = std::io::Result<Self::Stream>> + Unpin + Send + 'static;

    /// Starts accepting connections, resolving to the address peers can
    /// connect to.
    fn listen(&self) -> BoxFuture<'static, std::io::Result<(String, Self::Listener)>>;

    fn connect(&self, address: &str) -> BoxFuture<'static, std::io::Result<Self::Stream>>;
}

pub(crate) async fn connect<T: Transport>(
    transport: &T,
    address: &str,
    timeout: Duration,
) -> Result<Connection<T::Stream>, RegistryError> {
    let connecting = transport
        .connect(address)
        .map(|r| r.map_err(|e| IoError::new(format!("connecting to {}", address), e)));
    let timing_out = futures_timer::Delay::new(timeout)
        .map(|()| Err(IoError::timed_out(format!("connecting to {}", address))));

    let stream = crate::util::Race::between(connecting, timing_out).await?;

    Ok(Connection::new(stream, address))
}
