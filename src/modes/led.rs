//! Addressable LED strip mode.
//!
//! Pixels written through the syntax accumulate in a frame buffer; the stop
//! element latches the frame onto the wire. APA102 strips get the clocked
//! start/data/end frame sequence; WS2812 strips get the GRB byte stream
//! (bit timing is the shift engine's job on silicon). The onboard LEDs stay
//! with the second core and are only reachable through the intercore
//! channel.

use crate::Platform;
use crate::bio::PinPurpose;
use crate::bpio::{BpioError, DataRequest};
use crate::bytecode::Bytecode;
use crate::config;
use crate::time::Hertz;

use super::{
    ConfigError, LedKind, LedSetup, ModeConfig, ModeContext, ModeError, ProtocolMode, ReadBuffer,
};

pub const DATA: u8 = 0;
pub const CLOCK: u8 = 1;

pub const MAX_LEDS: usize = 256;

/// Encoded frame upper bound: APA102 start frame + 4 bytes per LED + end
/// frame.
pub const MAX_FRAME: usize = 4 + MAX_LEDS * 4 + (MAX_LEDS / 16) + 4;

#[derive(Debug, Default)]
pub struct LedMode {
    setup: LedSetup,
    configured: bool,
    pixels: heapless::Vec<u32, MAX_LEDS>,
    cursor: usize,
}

impl LedMode {
    /// Serializes the frame buffer into the wire byte stream.
    pub fn encode(&self, out: &mut heapless::Vec<u8, MAX_FRAME>) {
        match self.setup.kind {
            LedKind::Ws2812 => {
                for &pixel in &self.pixels {
                    // GRB order on the wire.
                    let _ = out.push((pixel >> 8) as u8);
                    let _ = out.push((pixel >> 16) as u8);
                    let _ = out.push(pixel as u8);
                }
            }
            LedKind::Apa102 => {
                for _ in 0..4 {
                    let _ = out.push(0x00);
                }
                for &pixel in &self.pixels {
                    // Global brightness full on; BGR order.
                    let _ = out.push(0xFF);
                    let _ = out.push(pixel as u8);
                    let _ = out.push((pixel >> 8) as u8);
                    let _ = out.push((pixel >> 16) as u8);
                }
                // Half a clock per LED of trailing ones latch the strip.
                for _ in 0..(self.pixels.len() / 16) + 4 {
                    let _ = out.push(0xFF);
                }
            }
            LedKind::Onboard => {}
        }
    }

    fn shift_out<P: Platform>(&self, ctx: &mut ModeContext<'_, P>, frame: &[u8]) {
        let clocked = self.setup.kind == LedKind::Apa102;
        for &byte in frame {
            for bit in (0..8).rev() {
                ctx.bio.put(DATA, byte & (1 << bit) != 0);
                if clocked {
                    ctx.bio.put(CLOCK, true);
                    ctx.bio.put(CLOCK, false);
                }
            }
        }
    }

    fn latch<P: Platform>(&mut self, ctx: &mut ModeContext<'_, P>) {
        if self.setup.kind == LedKind::Onboard {
            log::info!("onboard LEDs are owned by the second core; frame ignored here");
            return;
        }
        let mut frame = heapless::Vec::new();
        self.encode(&mut frame);
        self.shift_out(ctx, &frame);
    }
}

impl<P: Platform> ProtocolMode<P> for LedMode {
    fn name(&self) -> &'static str {
        "LED"
    }

    fn configure(&mut self, config: &ModeConfig) -> Result<(), ConfigError> {
        let ModeConfig::Led(setup) = config else {
            return Err(ConfigError::WrongMode);
        };
        if setup.num_leds == 0 || setup.num_leds as usize > MAX_LEDS {
            return Err(ConfigError::OutOfRange("led count"));
        }
        self.setup = *setup;
        self.configured = true;
        Ok(())
    }

    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        if !self.configured {
            if let Some(saved) = config::load_led(ctx.store) {
                self.setup = saved;
            }
            self.configured = true;
        }
        config::save_led(ctx.store, &self.setup);

        if self.setup.kind != LedKind::Onboard {
            ctx.bio.claim(DATA, PinPurpose::Mode, "SDO")?;
            ctx.bio.output(DATA);
            ctx.bio.put(DATA, false);
            if self.setup.kind == LedKind::Apa102 {
                ctx.bio.claim(CLOCK, PinPurpose::Mode, "SCL")?;
                ctx.bio.output(CLOCK);
                ctx.bio.put(CLOCK, false);
            }
        }
        self.pixels.clear();
        self.cursor = 0;
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut ModeContext<'_, P>) {
        self.pixels.clear();
        self.cursor = 0;
        for pin in [DATA, CLOCK] {
            let _ = ctx.bio.release(pin);
        }
    }

    fn get_speed(&self) -> Hertz {
        match self.setup.kind {
            // WS2812 runs its fixed 800 kbit/s stream.
            LedKind::Ws2812 => Hertz::from_raw(800_000),
            LedKind::Apa102 => Hertz::from_raw(1_000_000),
            LedKind::Onboard => Hertz::from_raw(0),
        }
    }

    fn settings(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        write!(
            out,
            "LED device: {:?}, count: {}",
            self.setup.kind, self.setup.num_leds
        )
    }

    fn help(&self) -> &'static str {
        "[ reset frame, 0x..RRGGBB write pixel, ] latch frame"
    }

    fn start(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.pixels.clear();
        self.cursor = 0;
        result.message = Some("FRAME RESET");
    }

    /// Queues one 24-bit RGB pixel.
    fn write(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        if self.cursor >= self.setup.num_leds as usize {
            result.error = true;
            result.message = Some("past the end of the strip");
            return;
        }
        if self.pixels.push(result.out_data & 0x00FF_FFFF).is_err() {
            result.error = true;
            result.message = Some("frame buffer full");
            return;
        }
        self.cursor += 1;
    }

    fn stop(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.latch(ctx);
        result.message = Some("FRAME LATCHED");
    }

    fn binary_transaction(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
        request: &DataRequest<'_>,
        _read: &mut ReadBuffer,
    ) -> Result<(), BpioError> {
        // Pixels arrive as packed RGB byte triplets.
        if request.start_main || request.start_alt {
            self.pixels.clear();
            self.cursor = 0;
        }
        for rgb in request.data_write.chunks_exact(3) {
            let pixel = (rgb[0] as u32) << 16 | (rgb[1] as u32) << 8 | rgb[2] as u32;
            if self.cursor >= self.setup.num_leds as usize {
                return Err(BpioError::TooLarge);
            }
            self.pixels.push(pixel).map_err(|_| BpioError::TooLarge)?;
            self.cursor += 1;
        }
        if request.stop_main || request.stop_alt {
            self.latch(ctx);
        }
        Ok(())
    }
}
