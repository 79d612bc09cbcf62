/// Monotonic millisecond counter. Wraps at `u32::MAX`.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

/// A point `timeout_ms` after the moment it was armed.
///
/// Expiry is computed from the elapsed distance, so a counter that wraps
/// between arming and checking still expires on time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    start_ms: u32,
    timeout_ms: u32,
}

impl Deadline {
    pub fn after<C: Clock + ?Sized>(clock: &C, timeout_ms: u32) -> Self {
        Self {
            start_ms: clock.now_ms(),
            timeout_ms,
        }
    }

    pub fn expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        clock.now_ms().wrapping_sub(self.start_ms) >= self.timeout_ms
    }
}

#[cfg(feature = "embassy")]
pub use embassy::EmbassyClock;

#[cfg(feature = "embassy")]
mod embassy {
    use super::Clock;

    /// Clock backed by the `embassy-time` driver.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct EmbassyClock;

    impl Clock for EmbassyClock {
        fn now_ms(&self) -> u32 {
            embassy_time::Instant::now().as_millis() as u32
        }
    }
}
