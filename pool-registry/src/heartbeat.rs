use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::Either;
use futures::lock::Mutex;
use futures::stream::StreamExt;
use instant::Instant;
use tracing::debug;

use crate::communication::CommunicationHandler;
use crate::executor::Executor;
use crate::transport::Transport;

/// The moment the next heartbeat is due.
///
/// Any successful exchange with the server proves liveness as well, so it
/// pushes the deadline out just like a heartbeat does.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    interval: Duration,
    jitter: f64,
    deadline: Mutex<Instant>,
    nudger: mpsc::UnboundedSender<()>,
}

impl Heartbeat {
    pub fn new(interval: Duration, jitter: f64) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (nudger, nudges) = mpsc::unbounded();

        let heartbeat = Self {
            interval,
            jitter,
            deadline: Mutex::new(Instant::now() + interval),
            nudger,
        };

        (Arc::new(heartbeat), nudges)
    }

    fn next_deadline(&self) -> Instant {
        Instant::now() + crate::util::scaled(self.interval, 1.0 - self.jitter, 1.0)
    }

    pub async fn reset(&self) {
        *self.deadline.lock().await = self.next_deadline();
    }

    async fn remaining(&self) -> Duration {
        self.deadline
            .lock()
            .await
            .saturating_duration_since(Instant::now())
    }

    /// Wakes the heartbeat loop so it notices a stopped pool right away.
    pub fn nudge(&self) {
        let _ = self.nudger.unbounded_send(());
    }
}

pub(crate) async fn run<T: Transport, E: Executor>(
    comm: CommunicationHandler<T, E>,
    heartbeat: Arc<Heartbeat>,
    mut nudges: mpsc::UnboundedReceiver<()>,
) {
    loop {
        if comm.pool().is_stopped().await {
            break;
        }

        let remaining = heartbeat.remaining().await;

        if remaining.is_zero() {
            comm.send_heartbeat().await;
            heartbeat.reset().await;
            continue;
        }

        let sleep = futures_timer::Delay::new(remaining);

        if let Either::Right((None, _)) = futures::future::select(sleep, nudges.next()).await {
            break;
        }
    }

    debug!("Heartbeat loop ended.");
}
