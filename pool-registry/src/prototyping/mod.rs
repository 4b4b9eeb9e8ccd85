//! In-memory building blocks for experiments and tests.
//!
//! [`DirectNetwork`] is a [`Transport`] whose connections are pairs of
//! channels within the process. [`PrototypingServer`] implements the server
//! side of the registry protocol on top of any transport.

mod server;

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::future::FutureExt;
use futures::io::AsyncRead;
use futures::io::AsyncWrite;
use futures::lock::Mutex;
use futures::stream::Stream;
use futures::stream::StreamExt;
use tracing::trace;

use crate::transport::Transport;

pub use server::PrototypingServer;

type Listeners = HashMap<String, mpsc::UnboundedSender<DirectStream>>;

/// A network of in-process listeners.
///
/// Addresses are handed out by [`listen`][Transport::listen]. Connecting to an
/// address whose listener was dropped is refused, which is how a crashed
/// member looks to its peers. Clones share listeners and the refusal rate.
#[derive(Clone, Debug)]
pub struct DirectNetwork {
    listeners: Arc<Mutex<Listeners>>,
    hung: Arc<Mutex<Vec<mpsc::UnboundedReceiver<DirectStream>>>>,
    next_address: Arc<AtomicUsize>,
    /// Bits of an `f32`.
    refusal_rate: Arc<AtomicU32>,
    setup_delay: Option<rand_distr::Normal<f32>>,
}

impl DirectNetwork {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            hung: Arc::new(Mutex::new(Vec::new())),
            next_address: Arc::new(AtomicUsize::new(0)),
            refusal_rate: Arc::new(AtomicU32::new(0.0f32.to_bits())),
            setup_delay: None,
        }
    }

    /// A network on which a share of `refusal_rate` connection attempts is
    /// refused and connection setup takes `setup_delay` milliseconds.
    pub fn with_characteristics(refusal_rate: f32, setup_delay: rand_distr::Normal<f32>) -> Self {
        let network = Self {
            setup_delay: Some(setup_delay),
            ..Self::new()
        };

        network.set_refusal_rate(refusal_rate);

        network
    }

    pub fn set_refusal_rate(&self, refusal_rate: f32) {
        self.refusal_rate.store(refusal_rate.to_bits(), Ordering::Relaxed);
    }

    fn refusal_rate(&self) -> f32 {
        f32::from_bits(self.refusal_rate.load(Ordering::Relaxed))
    }

    /// Drops the listener at `address`, as if its process had crashed.
    pub async fn disconnect(&self, address: &str) {
        self.listeners.lock().await.remove(address);
    }

    /// Keeps accepting connections at `address` but never serves them, as if
    /// its process had stopped responding.
    pub async fn hang(&self, address: &str) {
        let (send, recv) = mpsc::unbounded();

        self.listeners.lock().await.insert(address.to_owned(), send);
        self.hung.lock().await.push(recv);
    }
}

impl Default for DirectNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for DirectNetwork {
    type Stream = DirectStream;
    type Listener = DirectListener;

    fn listen(&self) -> BoxFuture<'static, io::Result<(String, Self::Listener)>> {
        let listeners = Arc::clone(&self.listeners);
        let address = format!(
            "direct:{}",
            self.next_address.fetch_add(1, Ordering::Relaxed)
        );

        async move {
            let (send, recv) = mpsc::unbounded();

            listeners.lock().await.insert(address.clone(), send);

            Ok((address, DirectListener(recv)))
        }
        .boxed()
    }

    fn connect(&self, address: &str) -> BoxFuture<'static, io::Result<Self::Stream>> {
        let listeners = Arc::clone(&self.listeners);
        let address = address.to_owned();
        let refused = roll_for_failure(self.refusal_rate());
        let delay = self.setup_delay.as_ref().map(delay);

        async move {
            if let Some(delay) = delay {
                futures_timer::Delay::new(delay).await;
            }

            if refused {
                trace!("Refusing connection to {} at random.", address);
                return Err(io::ErrorKind::ConnectionRefused.into());
            }

            let (local, remote) = DirectStream::pair();

            let listeners = listeners.lock().await;
            let accepted = listeners
                .get(&address)
                .map_or(false, |l| l.unbounded_send(remote).is_ok());

            if accepted {
                Ok(local)
            } else {
                Err(io::ErrorKind::ConnectionRefused.into())
            }
        }
        .boxed()
    }
}

/// Incoming connections of a [`DirectNetwork`] address.
#[derive(Debug)]
pub struct DirectListener(mpsc::UnboundedReceiver<DirectStream>);

impl Stream for DirectListener {
    type Item = io::Result<DirectStream>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx).map(|s| s.map(Ok))
    }
}

/// One end of an in-memory connection.
///
/// Closing either end makes reads on the other end hit end of stream once all
/// data written before has been read.
#[derive(Debug)]
pub struct DirectStream {
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    chunk: Vec<u8>,
    position: usize,
}

impl DirectStream {
    fn pair() -> (Self, Self) {
        let (a_send, a_recv) = mpsc::unbounded();
        let (b_send, b_recv) = mpsc::unbounded();

        (Self::new(a_send, b_recv), Self::new(b_send, a_recv))
    }

    fn new(
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            outgoing: Some(outgoing),
            incoming,
            chunk: Vec::new(),
            position: 0,
        }
    }
}

impl AsyncRead for DirectStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        while this.position >= this.chunk.len() {
            match this.incoming.poll_next_unpin(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.chunk = chunk;
                    this.position = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }

        let available = &this.chunk[this.position..];
        let n = available.len().min(buf.len());

        buf[..n].copy_from_slice(&available[..n]);
        this.position += n;

        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for DirectStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let sent = self
            .outgoing
            .as_ref()
            .map_or(false, |o| o.unbounded_send(buf.to_vec()).is_ok());

        if sent {
            Poll::Ready(Ok(buf.len()))
        } else {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.outgoing = None;

        Poll::Ready(Ok(()))
    }
}

fn roll_for_failure(rate: f32) -> bool {
    use rand::Rng;

    rand::thread_rng().gen::<f32>() < rate
}

fn delay(distr: &rand_distr::Normal<f32>) -> std::time::Duration {
    use rand::distributions::Distribution;

    let delay_ms = distr.sample(&mut rand::thread_rng()).max(0.0);
    let delay_ms = delay_ms as u64;

    std::time::Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use futures::io::AsyncReadExt;
    use futures::io::AsyncWriteExt;

    use super::*;

    #[test]
    fn bytes_written_on_one_end_are_read_on_the_other() {
        block_on(async {
            let network = DirectNetwork::new();
            let (address, mut listener) = network.listen().await.unwrap();

            let mut client = network.connect(&address).await.unwrap();
            let mut server = listener.next().await.unwrap().unwrap();

            client.write_all(b"ping").await.unwrap();
            client.close().await.unwrap();

            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();

            assert_eq!(received, b"ping");
        });
    }

    #[test]
    fn connecting_to_a_dropped_listener_is_refused() {
        block_on(async {
            let network = DirectNetwork::new();
            let (address, listener) = network.listen().await.unwrap();

            drop(listener);

            let err = network.connect(&address).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        });
    }

    #[test]
    fn hung_addresses_accept_but_never_answer() {
        block_on(async {
            let network = DirectNetwork::new();
            let (address, _listener) = network.listen().await.unwrap();

            network.hang(&address).await;

            let mut client = network.connect(&address).await.unwrap();
            client.write_all(b"anyone there?").await.unwrap();

            let mut buf = [0; 1];
            let read = crate::util::with_timeout(
                client.read(&mut buf),
                Some(std::time::Duration::from_millis(50)),
            )
            .await;

            assert!(read.is_none());
        });
    }

    #[test]
    fn refusal_rate_is_shared_by_clones() {
        block_on(async {
            let network = DirectNetwork::new();
            let (address, _listener) = network.listen().await.unwrap();

            network.clone().set_refusal_rate(1.0);
            assert!(network.connect(&address).await.is_err());

            network.set_refusal_rate(0.0);
            assert!(network.connect(&address).await.is_ok());
        });
    }

    #[test]
    fn disconnected_addresses_refuse_connections() {
        block_on(async {
            let network = DirectNetwork::new();
            let (address, _listener) = network.listen().await.unwrap();

            network.disconnect(&address).await;

            assert!(network.connect(&address).await.is_err());
        });
    }
}
