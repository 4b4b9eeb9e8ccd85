use std::future::Future;
use std::time::Duration;

use futures::future::FutureExt;
use pin_project::pin_project;

#[pin_project]
pub struct Race<A, B, T>
where
    A: Future<Output = T>,
    B: Future<Output = T>,
{
    #[pin]
    first: A,
    #[pin]
    second: B,
}

impl<A, B, T> Race<A, B, T>
where
    A: Future<Output = T>,
    B: Future<Output = T>,
{
    pub fn between(first: A, second: B) -> Self {
        Race { first, second }
    }
}

impl<A, B, T> Future for Race<A, B, T>
where
    A: Future<Output = T>,
    B: Future<Output = T>,
{
    type Output = T;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();

        match this.first.poll(cx) {
            std::task::Poll::Pending => this.second.poll(cx),
            ready => ready,
        }
    }
}

/// Resolves to `None` if `future` does not complete within `timeout`.
pub async fn with_timeout<F: Future>(future: F, timeout: Option<Duration>) -> Option<F::Output> {
    match timeout {
        Some(timeout) => {
            Race::between(
                future.map(Some),
                futures_timer::Delay::new(timeout).map(|_| None),
            )
            .await
        }
        None => Some(future.await),
    }
}

/// Uniformly distributed in `[low, high)` times `base`.
pub fn scaled(base: Duration, low: f64, high: f64) -> Duration {
    use rand::Rng;

    if high <= low {
        return base.mul_f64(low.max(0.0));
    }

    base.mul_f64(rand::thread_rng().gen_range(low..high))
}
