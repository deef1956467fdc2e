// Monotonic cycle counter used by the GK state machine and LLS cache aging.
//
// The real source counts TSC cycles and carries a `picosec_per_cycle`
// conversion constant measured at startup. We have no TSC to read here, so a
// "cycle" is realized as one nanosecond since an arbitrary fixed epoch,
// making `picosec_per_cycle` the constant 1000.

pub const PICOSEC_PER_CYCLE: u64 = 1000;

/// Cycles elapsed per whole second, for `now + n * cycles_per_second(1)`-style
/// arithmetic in the GK state machine and LLS scan timer.
pub fn cycles_per_second(n: u64) -> u64 {
    n * 1_000_000_000
}

pub fn cycles_per_ms(n: u64) -> u64 {
    n * 1_000_000
}

/// A source of monotonically non-decreasing cycle counts. Abstracted so
/// tests can drive the GK state machine with exact, repeatable `now` values
/// instead of a wall clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock {
    epoch: std::sync::OnceLock<std::time::Instant>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: std::sync::OnceLock::new(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        let epoch = self.epoch.get_or_init(std::time::Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

/// A clock a test can set to an arbitrary value, for exercising the exact
/// scenarios in spec.md's end-to-end section.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Default)]
pub struct FakeClock {
    now: std::sync::atomic::AtomicU64,
}

#[cfg(any(test, feature = "test-support"))]
impl FakeClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: std::sync::atomic::AtomicU64::new(start),
        }
    }

    pub fn set(&self, value: u64) {
        self.now.store(value, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn advance(&self, delta: u64) {
        self.now.fetch_add(delta, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Clock for FakeClock {
    fn now(&self) -> u64 {
        self.now.load(std::sync::atomic::Ordering::Relaxed)
    }
}
