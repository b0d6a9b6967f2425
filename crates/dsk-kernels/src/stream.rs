//! In-order submission queues.
//!
//! A device is a dedicated thread pool; a `Stream` is a FIFO queue onto it.
//! Submissions on one stream run one after another in enqueue order, and
//! each kernel fans out across the device's workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dsk_core::{DskError, Result};
use parking_lot::Mutex;
use rayon::ThreadPool;

use crate::launch::LaunchConfig;

/// Build the worker pool backing accelerator `device_index`.
///
/// `num_threads == 0` lets the pool size itself to the host.
pub fn build_device_pool(device_index: usize, num_threads: usize) -> Result<Arc<ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(move |i| format!("xpu{device_index}-cu{i}"))
        .build()
        .map(Arc::new)
        .map_err(|e| {
            tracing::error!(device = device_index, error = %e, "failed to create device queue");
            DskError::fatal("create_queue", format!("device {device_index}: {e}"))
        })
}

/// An in-order work queue on one device.
pub struct Stream {
    id: usize,
    device_index: usize,
    pool: Arc<ThreadPool>,
    fifo: Mutex<()>,
    submitted: AtomicU64,
}

impl Stream {
    pub fn new(id: usize, device_index: usize, pool: Arc<ThreadPool>) -> Self {
        Self {
            id,
            device_index,
            pool,
            fifo: Mutex::new(()),
            submitted: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    /// Workers available to one kernel.
    pub fn compute_units(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Number of kernels submitted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Enqueue a kernel. It starts after every earlier submission on this
    /// stream has finished and runs on the device workers.
    pub fn submit<R, F>(&self, name: &'static str, cfg: LaunchConfig, kernel: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let _order = self.fifo.lock();
        tracing::trace!(
            stream = self.id,
            kernel = name,
            grid = cfg.grid_dim,
            block = cfg.block_dim,
            "submit"
        );
        let out = self.pool.install(kernel);
        self.submitted.fetch_add(1, Ordering::AcqRel);
        out
    }

    /// Wait until all submitted work has completed.
    pub fn synchronize(&self) {
        drop(self.fifo.lock());
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("device", &self.device_index)
            .field("submitted", &self.submitted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::grid_1d;

    #[test]
    fn test_submit_runs_on_device_pool() {
        let pool = build_device_pool(0, 2).unwrap();
        let stream = Stream::new(0, 0, pool);
        let name = stream.submit("thread_name", grid_1d(1), || {
            std::thread::current().name().map(str::to_owned)
        });
        assert_eq!(name.as_deref().map(|n| n.starts_with("xpu0-cu")), Some(true));
        assert_eq!(stream.submitted(), 1);
    }

    #[test]
    fn test_fifo_order_across_host_threads() {
        let pool = build_device_pool(0, 2).unwrap();
        let stream = Arc::new(Stream::new(1, 0, pool));
        let log = Arc::new(Mutex::new(Vec::new()));

        std::thread::scope(|s| {
            for t in 0..4 {
                let stream = Arc::clone(&stream);
                let log = Arc::clone(&log);
                s.spawn(move || {
                    for i in 0..10 {
                        stream.submit("append", grid_1d(1), || {
                            let mut log = log.lock();
                            // A kernel sees the queue to itself: no interleaving
                            // between the push and the check below.
                            log.push((t, i));
                            let len = log.len();
                            assert_eq!(log[len - 1], (t, i));
                        });
                    }
                });
            }
        });

        stream.synchronize();
        assert_eq!(stream.submitted(), 40);
        let log = log.lock();
        for t in 0..4 {
            let mine: Vec<_> = log.iter().filter(|(tt, _)| *tt == t).map(|(_, i)| *i).collect();
            assert_eq!(mine, (0..10).collect::<Vec<_>>());
        }
    }
}
