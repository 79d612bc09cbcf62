//! ESP32 board glue: clock, SPI settings and logger bootstrap.

use esp_hal::{
    gpio::Output,
    spi::{
        master::{Config as SpiConfig, Spi},
        Mode as SpiMode,
    },
    time::{Instant, Rate},
    Blocking,
};

use crate::{clock::Clock, probe::SdCard};

/// Bring-up must run at 400 kHz or below.
pub const SD_INIT_SPI_KHZ: u32 = 400;

pub type EspSdCard<'d> = SdCard<Spi<'d, Blocking>, Output<'d>, EspClock>;

/// Millisecond clock on the esp-hal system timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> u32 {
        Instant::now().duration_since_epoch().as_millis() as u32
    }
}

/// SPI mode 0 at the bring-up clock rate.
pub fn sd_spi_config() -> SpiConfig {
    SpiConfig::default()
        .with_frequency(Rate::from_khz(SD_INIT_SPI_KHZ))
        .with_mode(SpiMode::_0)
}

/// Routes `log` records to the UART through `esp-println`.
pub fn init_logger(level: log::LevelFilter) {
    esp_println::logger::init_logger(level);
}
