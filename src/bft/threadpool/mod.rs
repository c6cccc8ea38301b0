//! A thread pool abstraction over a range of other crates.

#[cfg(feature = "threadpool_crossbeam")]
mod crossbeam {
    pub type ThreadPool = ::threadpool_crossbeam_channel::ThreadPool;
    pub type Builder = ::threadpool_crossbeam_channel::Builder;
}

use crate::bft::error::*;

/// A thread pool, executing jobs on a fixed number of worker threads.
#[derive(Clone)]
pub struct ThreadPool {
    #[cfg(feature = "threadpool_crossbeam")]
    inner: crossbeam::ThreadPool,
}

/// Helper type used to construct a new `ThreadPool`.
pub struct Builder {
    num_threads: Option<usize>,
}

impl Builder {
    /// Creates a new `ThreadPool` builder.
    pub fn new() -> Self {
        Self { num_threads: None }
    }

    /// Sets the number of worker threads of the pool.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Builds the pool.
    pub fn build(self) -> ThreadPool {
        let mut builder = crossbeam::Builder::new();
        if let Some(n) = self.num_threads {
            builder = builder.num_threads(n);
        }
        ThreadPool {
            inner: builder.build(),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPool {
    /// Spawns a new job into the thread pool.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.execute(job);
    }

    /// Synchronously waits for all the jobs queued in the pool
    /// to complete.
    pub fn join(&self) {
        self.inner.join();
    }
}

/// Spawns a job into an ad hoc single use thread.
pub fn spawn_named<F>(name: &str, job: F) -> Result<std::thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.into())
        .spawn(job)
        .wrapped(ErrorKind::Threadpool)
}
