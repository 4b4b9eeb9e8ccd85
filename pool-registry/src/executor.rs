//! Defines the [`Executor`] trait and its [default implementation][StdThread].

use futures::FutureExt;

/// The executor used to run the pool, its background loops and the handlers
/// of inbound connections.
pub trait Executor: Clone + Send + Sync + 'static {
    /// Type of error yielded when a task cannot be executed.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Executes the given task.
    fn execute<F: std::future::Future<Output = ()> + Send + 'static>(
        &self,
        task: F,
    ) -> Result<(), Self::Error>;
}

impl<S: futures::task::Spawn + Clone + Send + Sync + 'static> Executor for S {
    type Error = futures::task::SpawnError;

    fn execute<F: std::future::Future<Output = ()> + Send + 'static>(
        &self,
        task: F,
    ) -> Result<(), Self::Error> {
        self.spawn_obj(futures::task::FutureObj::from(task.boxed()))
    }
}

/// Executor which spawns a new thread for each task.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdThread;

impl Executor for StdThread {
    type Error = std::io::Error;

    fn execute<F: std::future::Future<Output = ()> + Send + 'static>(
        &self,
        task: F,
    ) -> Result<(), Self::Error> {
        let builder = std::thread::Builder::new().name("pool-registry".into());

        builder
            .spawn(|| {
                futures::executor::block_on(task);
            })
            .map(|_| ())
    }
}
