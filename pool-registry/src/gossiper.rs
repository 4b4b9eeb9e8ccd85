use tracing::debug;

use crate::communication::CommunicationHandler;
use crate::executor::Executor;
use crate::transport::Transport;

/// Gossips with a random member, then sleeps a random fraction of
/// `spread × interval`, until the pool stops.
pub(crate) async fn run<T: Transport, E: Executor>(comm: CommunicationHandler<T, E>) {
    let interval = comm.config().gossip_interval();
    let spread = comm.config().gossip_spread();

    let pool = comm.pool().clone();
    let stopped = pool.stopped();
    futures::pin_mut!(stopped);

    loop {
        match pool.random_peer().await {
            Ok(Some(peer)) => {
                if let Err(e) = comm.gossip(&peer).await {
                    debug!("Gossip with {} failed: {}", peer, e);
                }
            }
            Ok(None) => {}
            Err(_) => break,
        }

        let sleep = futures_timer::Delay::new(crate::util::scaled(interval, 0.0, spread));

        if let futures::future::Either::Right(_) =
            futures::future::select(sleep, stopped.as_mut()).await
        {
            break;
        }
    }

    debug!("Gossiper ended.");
}
