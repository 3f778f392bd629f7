//! Persisted mode configuration.
//!
//! Each mode keeps its settings in a named short file of `$.key=value`
//! lines, values in decimal. Load and save are best-effort: a missing or
//! unparsable file selects defaults. The storage medium itself (FAT on the
//! SD card in the full firmware) stays behind [`ConfigStore`].
//!
//! Some key names are historical and no longer match what they hold (the
//! SPI file stores the clock polarity under `$.stop_bits`). The wire format
//! is kept for compatibility with existing cards; only the in-memory names
//! were fixed.

use core::fmt::Write as _;

use crate::modes::{I2cSetup, LedKind, LedSetup, ModeId, SpiSetup, UartParity, UartSetup};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    #[error("file not found")]
    NotFound,
    #[error("storage full")]
    Full,
    #[error("storage io failed")]
    Io,
}

/// Named-file storage for the `*.bp` configuration files.
pub trait ConfigStore {
    fn save(&mut self, name: &str, contents: &[u8]) -> Result<(), StoreError>;
    /// Copies the file into `out` and returns the length.
    fn load(&self, name: &str, out: &mut [u8]) -> Result<usize, StoreError>;
}

/// Largest configuration file the codec handles.
pub const MAX_FILE: usize = 256;

/// Serializes `$.key=value` lines into `out`.
pub fn encode(pairs: &[(&str, u32)], out: &mut [u8]) -> Option<usize> {
    let mut cursor = Cursor { out, used: 0 };
    for (key, value) in pairs {
        write!(cursor, "$.{key}={value}\n").ok()?;
    }
    Some(cursor.used)
}

struct Cursor<'a> {
    out: &'a mut [u8],
    used: usize,
}

impl core::fmt::Write for Cursor<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        if self.used + bytes.len() > self.out.len() {
            return Err(core::fmt::Error);
        }
        self.out[self.used..self.used + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        Ok(())
    }
}

/// Finds `$.key=` in the file and parses the decimal value after it.
/// Malformed lines are skipped, matching the forgiving C parser.
pub fn decode_get(contents: &[u8], key: &str) -> Option<u32> {
    let text = core::str::from_utf8(contents).ok()?;
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("$.") else {
            continue;
        };
        let Some((name, value)) = rest.split_once('=') else {
            continue;
        };
        if name == key
            && let Ok(parsed) = value.trim().parse::<u32>()
        {
            return Some(parsed);
        }
    }
    None
}

fn load_file<'a, S: ConfigStore>(store: &S, name: &str, buf: &'a mut [u8]) -> Option<&'a [u8]> {
    let len = store.load(name, buf).ok()?;
    Some(&buf[..len])
}

fn save_pairs<S: ConfigStore>(store: &mut S, name: &str, pairs: &[(&str, u32)]) {
    let mut buf = [0u8; MAX_FILE];
    let Some(len) = encode(pairs, &mut buf) else {
        log::warn!("config: {name} does not fit the codec buffer");
        return;
    };
    if let Err(error) = store.save(name, &buf[..len]) {
        log::warn!("config: saving {name} failed: {error}");
    }
}

//==================================================================================================
// Per-mode files
//==================================================================================================

pub const SPI_FILE: &str = "bpspi.bp";
pub const I2C_FILE: &str = "bpi2c.bp";
pub const UART_FILE: &str = "bpuart.bp";
pub const LED_FILE: &str = "bpled.bp";
pub const BINMODE_FILE: &str = "bpbinmod.bp";

pub fn save_spi<S: ConfigStore>(store: &mut S, setup: &SpiSetup) {
    save_pairs(
        store,
        SPI_FILE,
        &[
            ("speed", setup.speed_hz),
            ("databits", setup.data_bits as u32),
            // Historical key: the file has always stored the clock polarity
            // under "stop_bits".
            ("stop_bits", setup.clock_polarity as u32),
            ("cpha", setup.clock_phase as u32),
            ("csidle", setup.chip_select_idle_high as u32),
        ],
    );
}

pub fn load_spi<S: ConfigStore>(store: &S) -> Option<SpiSetup> {
    let mut buf = [0u8; MAX_FILE];
    let file = load_file(store, SPI_FILE, &mut buf)?;
    let defaults = SpiSetup::default();
    Some(SpiSetup {
        speed_hz: decode_get(file, "speed").unwrap_or(defaults.speed_hz),
        data_bits: decode_get(file, "databits").unwrap_or(defaults.data_bits as u32) as u8,
        clock_polarity: decode_get(file, "stop_bits").unwrap_or(0) != 0,
        clock_phase: decode_get(file, "cpha").unwrap_or(0) != 0,
        chip_select_idle_high: decode_get(file, "csidle").unwrap_or(1) != 0,
    })
}

pub fn save_i2c<S: ConfigStore>(store: &mut S, setup: &I2cSetup) {
    save_pairs(
        store,
        I2C_FILE,
        &[
            ("speed", setup.speed_hz),
            ("databits", setup.data_bits as u32),
            ("stretch", setup.clock_stretch as u32),
        ],
    );
}

pub fn load_i2c<S: ConfigStore>(store: &S) -> Option<I2cSetup> {
    let mut buf = [0u8; MAX_FILE];
    let file = load_file(store, I2C_FILE, &mut buf)?;
    let defaults = I2cSetup::default();
    Some(I2cSetup {
        speed_hz: decode_get(file, "speed").unwrap_or(defaults.speed_hz),
        data_bits: decode_get(file, "databits").unwrap_or(defaults.data_bits as u32) as u8,
        clock_stretch: decode_get(file, "stretch").unwrap_or(0) != 0,
    })
}

pub fn save_uart<S: ConfigStore>(store: &mut S, setup: &UartSetup) {
    save_pairs(
        store,
        UART_FILE,
        &[
            ("baud", setup.baud),
            ("parity", setup.parity as u32),
            ("databits", setup.data_bits as u32),
            ("stopbits", setup.stop_bits as u32),
            ("flow", setup.flow_control as u32),
            ("invert", setup.invert as u32),
        ],
    );
}

pub fn load_uart<S: ConfigStore>(store: &S) -> Option<UartSetup> {
    let mut buf = [0u8; MAX_FILE];
    let file = load_file(store, UART_FILE, &mut buf)?;
    let defaults = UartSetup::default();
    Some(UartSetup {
        baud: decode_get(file, "baud").unwrap_or(defaults.baud),
        parity: match decode_get(file, "parity") {
            Some(1) => UartParity::Odd,
            Some(2) => UartParity::Even,
            _ => UartParity::None,
        },
        data_bits: decode_get(file, "databits").unwrap_or(defaults.data_bits as u32) as u8,
        stop_bits: decode_get(file, "stopbits").unwrap_or(defaults.stop_bits as u32) as u8,
        flow_control: decode_get(file, "flow").unwrap_or(0) != 0,
        invert: decode_get(file, "invert").unwrap_or(0) != 0,
    })
}

pub fn save_led<S: ConfigStore>(store: &mut S, setup: &LedSetup) {
    save_pairs(
        store,
        LED_FILE,
        &[
            ("device", setup.kind as u32),
            ("num_leds", setup.num_leds as u32),
        ],
    );
}

pub fn load_led<S: ConfigStore>(store: &S) -> Option<LedSetup> {
    let mut buf = [0u8; MAX_FILE];
    let file = load_file(store, LED_FILE, &mut buf)?;
    let defaults = LedSetup::default();
    Some(LedSetup {
        kind: match decode_get(file, "device") {
            Some(1) => LedKind::Apa102,
            Some(2) => LedKind::Onboard,
            Some(0) => LedKind::Ws2812,
            _ => defaults.kind,
        },
        num_leds: decode_get(file, "num_leds").unwrap_or(defaults.num_leds as u32) as u16,
    })
}

/// Remembers which mode the binary channel configured last.
pub fn save_binmode<S: ConfigStore>(store: &mut S, mode: ModeId) {
    save_pairs(store, BINMODE_FILE, &[("binmode", mode as u32)]);
}
