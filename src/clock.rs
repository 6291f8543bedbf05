//! Microsecond clock used for SIO reply timing and the ATX rotor simulation.
//!
//! All waits are spin-waits against the clock; nothing here sleeps the
//! thread or can be interrupted. Tests use [`FakeClock`], which jumps straight
//! to the deadline so a whole retry sequence runs instantly but still reports
//! the simulated elapsed time.

use std::cell::Cell;
use std::time::Instant;

pub trait Clock {
    /// Microseconds since an arbitrary fixed epoch.
    fn now_us(&self) -> u64;

    /// Blocks until `now_us() >= deadline`.
    fn wait_until(&self, deadline: u64);

    /// Blocks for `us` microseconds from now.
    fn wait_us(&self, us: u64) {
        self.wait_until(self.now_us() + us);
    }
}

/// Wall clock backed by [`Instant`].
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn wait_until(&self, deadline: u64) {
        while self.now_us() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Deterministic clock: waiting advances time to the deadline immediately.
#[derive(Debug, Default)]
pub struct FakeClock {
    now: Cell<u64>,
}

impl FakeClock {
    #[must_use]
    pub fn new(start_us: u64) -> Self {
        Self {
            now: Cell::new(start_us),
        }
    }

    /// Moves time forward without anyone waiting (e.g. guest think time).
    pub fn advance(&self, us: u64) {
        self.now.set(self.now.get() + us);
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> u64 {
        self.now.get()
    }

    fn wait_until(&self, deadline: u64) {
        if deadline > self.now.get() {
            self.now.set(deadline);
        }
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn wait_until(&self, deadline: u64) {
        (**self).wait_until(deadline);
    }
}
