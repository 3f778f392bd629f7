//! High-impedance safe mode.
//!
//! HiZ is mode zero and the sink state of every mode change: all pins
//! input, power supply off, pull-ups off, frequency and PWM generators
//! stopped, every claim released. Entering it must always succeed, which is
//! why it claims nothing itself.

use crate::Platform;
use crate::time::Hertz;

use super::{ModeContext, ModeError, ProtocolMode};

#[derive(Debug, Default)]
pub struct HiZMode;

impl<P: Platform> ProtocolMode<P> for HiZMode {
    fn name(&self) -> &'static str {
        "HiZ"
    }

    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        ctx.bio.release_all();
        ctx.power.psu_enabled = false;
        ctx.power.pullups_enabled = false;
        ctx.power.freq_active = 0;
        ctx.power.pwm_active = 0;
        // The passive state is a hard guarantee, not a best effort.
        assert!(ctx.bio.claimed_count() == 0, "pin claims survived HiZ entry");
        assert!(ctx.power.all_off(), "power path still active after HiZ entry");
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut ModeContext<'_, P>) {}

    fn get_speed(&self) -> Hertz {
        Hertz::from_raw(0)
    }

    fn help(&self) -> &'static str {
        "HiZ is a safe mode. IO pins, power and pull-ups are disabled.\r\n\
         To enter an active mode type 'm' and press enter."
    }
}
