//! Runtime context: streams, RNG state, workspace and GEMM algorithm tags.
//!
//! One `Context` per device is constructed explicitly and passed to every
//! operator. It owns the device worker pool, a default stream plus a small
//! round-robin pool of extra streams, the Philox seed and offset counter,
//! the scratch workspace and the tuned GEMM algorithms.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use dsk_core::{Device, DskError, FatalError, Result};
use half::f16;
use parking_lot::{Mutex, RwLock};
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::blas::{GemmAlgo, Transpose};
use crate::gemm_test::{GemmTest, StridedGemmTest};
use crate::stream::{build_device_pool, Stream};

/// Timed iterations per candidate when tuning GEMM algorithms.
const TUNE_LOOPS: usize = 100;

/// Construction parameters for a [`Context`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Accelerator ordinal the context drives.
    pub device_index: usize,

    /// Worker threads in the device pool (0 sizes the pool to the host).
    pub num_threads: usize,

    /// Extra streams handed out by [`Context::new_stream`].
    pub stream_pool_size: usize,

    /// Initial Philox seed.
    pub seed: u64,

    /// Hand out offset 0 from every reservation so runs are bit-reproducible.
    pub deterministic: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            num_threads: 0,
            stream_pool_size: 4,
            seed: 42,
            deterministic: false,
        }
    }
}

impl ContextConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DskError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text).map_err(|e| DskError::Config(format!("{}: {e}", path.display())))
    }

    /// Defaults overridden by `DSK_SEED`, `DSK_DETERMINISTIC`,
    /// `DSK_NUM_THREADS` and `DSK_DEVICE`.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply the `DSK_*` environment overrides on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("DSK_SEED") {
            self.seed = parse_var("DSK_SEED", &v)?;
        }
        if let Some(v) = lookup("DSK_DETERMINISTIC") {
            self.deterministic = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => {
                    return Err(DskError::Config(format!("DSK_DETERMINISTIC: invalid value {other:?}")))
                }
            };
        }
        if let Some(v) = lookup("DSK_NUM_THREADS") {
            self.num_threads = parse_var("DSK_NUM_THREADS", &v)?;
        }
        if let Some(v) = lookup("DSK_DEVICE") {
            self.device_index = parse_var("DSK_DEVICE", &v)?;
        }
        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| DskError::Config(format!("{key}: invalid value {value:?}: {e}")))
}

/// Per-device runtime state shared by every operator call.
pub struct Context {
    config: ContextConfig,
    pool: Arc<ThreadPool>,
    default_stream: Arc<Stream>,
    stream_pool: Vec<Arc<Stream>>,
    /// Per host thread stream overrides; threads without one use the default stream.
    current: Mutex<HashMap<ThreadId, Arc<Stream>>>,
    next_stream: AtomicUsize,
    seed: AtomicU64,
    offset: AtomicU64,
    workspace: Mutex<Option<Vec<u8>>>,
    gemm_algos: RwLock<Vec<[GemmAlgo; 3]>>,
    poisoned: OnceLock<FatalError>,
}

impl Context {
    pub fn new(config: ContextConfig) -> Result<Self> {
        let pool = build_device_pool(config.device_index, config.num_threads)?;
        let default_stream = Arc::new(Stream::new(0, config.device_index, pool.clone()));
        let stream_pool = (1..=config.stream_pool_size)
            .map(|id| Arc::new(Stream::new(id, config.device_index, pool.clone())))
            .collect();

        tracing::debug!(
            device = config.device_index,
            workers = pool.current_num_threads(),
            streams = config.stream_pool_size + 1,
            seed = config.seed,
            deterministic = config.deterministic,
            "context created"
        );

        Ok(Self {
            current: Mutex::new(HashMap::new()),
            seed: AtomicU64::new(config.seed),
            config,
            pool,
            default_stream,
            stream_pool,
            next_stream: AtomicUsize::new(0),
            offset: AtomicU64::new(0),
            workspace: Mutex::new(None),
            gemm_algos: RwLock::new(Vec::new()),
            poisoned: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn device_index(&self) -> usize {
        self.config.device_index
    }

    /// The device tensors must live on to be accepted by operators.
    pub fn device(&self) -> Device {
        Device::Xpu(self.config.device_index)
    }

    pub fn compute_units(&self) -> usize {
        self.pool.current_num_threads()
    }

    // =======================================================================
    // Streams
    // =======================================================================

    /// The stream operators called from this thread submit to.
    pub fn current_stream(&self) -> Arc<Stream> {
        self.current
            .lock()
            .get(&thread::current().id())
            .cloned()
            .unwrap_or_else(|| self.default_stream.clone())
    }

    pub fn set_current_stream(&self, stream: Arc<Stream>) -> Result<()> {
        if stream.device_index() != self.config.device_index {
            return Err(DskError::Precondition(format!(
                "stream {} belongs to device {}, context drives device {}",
                stream.id(),
                stream.device_index(),
                self.config.device_index
            )));
        }
        self.current.lock().insert(thread::current().id(), stream);
        Ok(())
    }

    /// Make the default stream current again for the calling thread.
    pub fn reset_stream(&self) {
        self.current.lock().remove(&thread::current().id());
    }

    /// Next stream from the pool, round robin. Falls back to the default
    /// stream when the pool is empty.
    pub fn new_stream(&self) -> Arc<Stream> {
        if self.stream_pool.is_empty() {
            return self.default_stream.clone();
        }
        let i = self.next_stream.fetch_add(1, Ordering::Relaxed) % self.stream_pool.len();
        self.stream_pool[i].clone()
    }

    // =======================================================================
    // RNG state
    // =======================================================================

    /// Reserve `n` counter blocks. Returns the seed and the first block of
    /// the reserved range; concurrent callers get disjoint ranges.
    pub fn increment_offset(&self, n: u64) -> (u64, u64) {
        let seed = self.seed.load(Ordering::Acquire);
        let offset = self.offset.fetch_add(n, Ordering::AcqRel);
        if self.config.deterministic {
            (seed, 0)
        } else {
            (seed, offset)
        }
    }

    pub fn set_seed(&self, seed: u64) {
        self.seed.store(seed, Ordering::Release);
    }

    pub fn seed(&self) -> u64 {
        self.seed.load(Ordering::Acquire)
    }

    /// Next unreserved counter block.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    // =======================================================================
    // Workspace
    // =======================================================================

    pub fn set_workspace(&self, buffer: Vec<u8>) -> Result<()> {
        if buffer.is_empty() {
            return Err(DskError::NullWorkspace);
        }
        *self.workspace.lock() = Some(buffer);
        Ok(())
    }

    pub fn workspace_size(&self) -> Option<usize> {
        self.workspace.lock().as_ref().map(Vec::len)
    }

    /// Run `f` with exclusive access to the workspace.
    pub fn with_workspace<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut guard = self.workspace.lock();
        let buf = guard.as_mut().ok_or(DskError::WorkspaceNotSet)?;
        Ok(f(buf))
    }

    // =======================================================================
    // GEMM algorithm selection
    // =======================================================================

    /// Fill the five transformer GEMM slots (qkv, intermediate, output,
    /// attention scores, attention context). Runs once; later calls keep
    /// the existing tags. Without `test_gemm` every slot gets
    /// [`GemmAlgo::Default`].
    pub fn tune_gemm(
        &self,
        test_gemm: bool,
        batch_size: usize,
        seq_len: usize,
        head_num: usize,
        size_per_head: usize,
    ) -> Result<()> {
        self.ensure_healthy()?;
        let mut algos = self.gemm_algos.write();
        if !algos.is_empty() {
            return Ok(());
        }
        if !test_gemm {
            algos.extend([[GemmAlgo::Default; 3]; 5]);
            return Ok(());
        }

        let stream = self.current_stream();
        let tokens = batch_size * seq_len;
        let hidden = head_num * size_per_head;
        let (t, n) = (Transpose::Trans, Transpose::NoTrans);
        tracing::debug!(batch_size, seq_len, head_num, size_per_head, "tuning gemm algorithms");

        let tuned = [
            GemmTest::<f16>::new(stream.clone(), tokens, hidden, hidden, t, n).test_algo(TUNE_LOOPS),
            GemmTest::<f16>::new(stream.clone(), tokens, 4 * hidden, hidden, t, n).test_algo(TUNE_LOOPS),
            GemmTest::<f16>::new(stream.clone(), tokens, hidden, 4 * hidden, t, n).test_algo(TUNE_LOOPS),
            StridedGemmTest::<f16>::new(stream.clone(), batch_size * head_num, seq_len, seq_len, size_per_head, t, n)
                .test_algo(TUNE_LOOPS),
            StridedGemmTest::<f16>::new(stream, batch_size * head_num, size_per_head, seq_len, seq_len, n, n)
                .test_algo(TUNE_LOOPS),
        ];
        let mut slots = Vec::with_capacity(tuned.len());
        for slot in tuned {
            slots.push(self.guard(slot)?);
        }
        *algos = slots;
        Ok(())
    }

    /// Tuned algorithm tags, one `[forward, backward1, backward2]` per slot.
    pub fn gemm_algos(&self) -> Vec<[GemmAlgo; 3]> {
        self.gemm_algos.read().clone()
    }

    // =======================================================================
    // Fatal errors
    // =======================================================================

    /// Fail with the recorded fatal error if one has been seen.
    pub fn ensure_healthy(&self) -> Result<()> {
        match self.poisoned.get() {
            Some(fatal) => Err(DskError::Fatal(fatal.clone())),
            None => Ok(()),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get().is_some()
    }

    /// Pass `result` through, recording the first fatal error. Once a fatal
    /// error is recorded every later [`Context::ensure_healthy`] fails.
    pub fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(DskError::Fatal(fatal)) = &result {
            if self.poisoned.set(fatal.clone()).is_ok() {
                tracing::error!(device = self.config.device_index, error = %fatal, "context poisoned");
            }
        }
        result
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.config.device_index)
            .field("workers", &self.compute_units())
            .field("seed", &self.seed())
            .field("offset", &self.offset())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}
