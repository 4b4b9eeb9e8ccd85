use tracing::debug;

use crate::communication::CommunicationHandler;
use crate::executor::Executor;
use crate::transport::Transport;

/// Forwards events to this member's children in the dissemination tree.
///
/// Children are served whenever local time advances, and at least once per
/// push interval so that children that missed a round catch up.
pub(crate) async fn run<T: Transport, E: Executor>(comm: CommunicationHandler<T, E>) {
    let interval = comm.config().event_push_interval();
    let pool = comm.pool().clone();

    let mut pushed = 0;

    loop {
        if pool
            .wait_for_event_time(pushed + 1, Some(interval))
            .await
            .is_err()
        {
            break;
        }

        let status = match pool.status().await {
            Ok(status) if !status.stopped => status,
            _ => break,
        };

        let children = match pool.children().await {
            Ok(children) => children,
            Err(_) => break,
        };

        for child in &children {
            if let Err(e) = comm.forward(child).await {
                debug!("Forwarding to {} failed: {}", child, e);
            }
        }

        pushed = status.time;
    }

    debug!("Pusher ended.");
}
