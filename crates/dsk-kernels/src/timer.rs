//! Wall-clock timers for host code and stream-ordered work.

use std::sync::Arc;
use std::time::Instant;

use crate::stream::Stream;

/// Measures time between two points on a stream.
///
/// [`GpuTimer::record`] and [`GpuTimer::elapsed_ms`] both wait for the
/// stream to drain, so the interval covers the submitted kernels.
pub struct GpuTimer {
    stream: Arc<Stream>,
    start: Instant,
}

impl GpuTimer {
    pub fn new(stream: Arc<Stream>) -> Self {
        stream.synchronize();
        Self {
            stream,
            start: Instant::now(),
        }
    }

    /// Mark the start of the interval.
    pub fn record(&mut self) {
        self.stream.synchronize();
        self.start = Instant::now();
    }

    /// Milliseconds since the last [`GpuTimer::record`].
    pub fn elapsed_ms(&self) -> f32 {
        self.stream.synchronize();
        self.start.elapsed().as_secs_f32() * 1e3
    }
}

/// Host-side stopwatch.
pub struct CpuTimer {
    start: Instant,
}

impl CpuTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    /// Milliseconds since the previous call (or construction); restarts the clock.
    pub fn elapsed_ms(&mut self) -> f32 {
        let now = Instant::now();
        let ms = now.duration_since(self.start).as_secs_f32() * 1e3;
        self.start = now;
        ms
    }
}

impl Default for CpuTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::grid_1d;
    use crate::stream::build_device_pool;
    use std::time::Duration;

    #[test]
    fn test_gpu_timer_covers_submitted_work() {
        let stream = Arc::new(Stream::new(0, 0, build_device_pool(0, 1).unwrap()));
        let mut timer = GpuTimer::new(stream.clone());
        timer.record();
        stream.submit("sleep", grid_1d(1), || std::thread::sleep(Duration::from_millis(5)));
        assert!(timer.elapsed_ms() >= 5.0);
    }

    #[test]
    fn test_cpu_timer_reset() {
        let mut timer = CpuTimer::new();
        std::thread::sleep(Duration::from_millis(2));
        assert!(timer.elapsed_ms() >= 2.0);
        // The previous call restarted the clock.
        assert!(timer.elapsed_ms() < 2.0);
        timer.reset();
        assert!(timer.elapsed_ms() < 1000.0);
    }
}
