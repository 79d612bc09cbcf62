use embedded_hal::delay::DelayNs;

pub const SD_POWER_SETTLE_MS: u32 = 250;

/// Blocks until a freshly powered card has settled.
pub fn power_on_settle<D: DelayNs>(delay: &mut D, settle_ms: u32) {
    if settle_ms > 0 {
        delay.delay_ms(settle_ms);
    }
}
