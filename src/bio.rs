//! Buffered IO pin management.
//!
//! Eight header pins (BIO0..BIO7) sit behind bidirectional buffer stages.
//! Modes claim each pin they use with a purpose and a label before touching
//! it and release it on cleanup; the claim table is how the safe mode proves
//! the device is passive again after a mode change.

use embedded_hal::digital::PinState;

/// Number of buffered IO pins on the header.
pub const BIO_PIN_COUNT: usize = 8;

/// What a claimed pin is being used for. Two claims on the same pin with
/// different purposes is a resource error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinPurpose {
    Io,
    Mode,
    Pwm,
    Freq,
    Vref,
    Vout,
    Ground,
    Debug,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinDirection {
    Input,
    Output,
}

/// Electrical access to the buffered pins. Implemented over the GPIO block
/// on silicon; [`crate::loopback::LoopbackPins`] implements it with
/// attachable device models for host runs.
pub trait PinBackend {
    fn set_direction(&mut self, pin: u8, direction: PinDirection);
    fn write(&mut self, pin: u8, state: PinState);
    /// Reads the electrical level of one pin. Takes `&mut self` because
    /// sampling may have side effects on simulated bus devices.
    fn read(&mut self, pin: u8) -> PinState;
    /// All eight pin levels, bit `n` = BIO`n`.
    fn read_all(&mut self) -> u8;
    /// Drives the pins selected by `mask` to the corresponding bits of
    /// `value` in one operation.
    fn write_masked(&mut self, mask: u8, value: u8);
    /// Busy-wait used to pace bit-banged buses. Simulated backends advance
    /// their model time here.
    fn delay_ns(&mut self, ns: u32);
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinClaimError {
    #[error("pin {pin} already claimed for {existing:?}")]
    AlreadyClaimed { pin: u8, existing: PinPurpose },
    #[error("pin {0} released without a claim")]
    NotClaimed(u8),
    #[error("pin {0} out of range")]
    OutOfRange(u8),
}

#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Claim {
    purpose: PinPurpose,
    label: &'static str,
}

/// The claim table plus the electrical backend behind it.
pub struct BioPins<B: PinBackend> {
    backend: B,
    claims: [Option<Claim>; BIO_PIN_COUNT],
}

impl<B: PinBackend> BioPins<B> {
    pub fn new(backend: B) -> Self {
        BioPins {
            backend,
            claims: [None; BIO_PIN_COUNT],
        }
    }

    /// Records a claim. Fails when the pin is already in use; `setup_exc`
    /// paths surface this as a resource error and roll back.
    pub fn claim(&mut self, pin: u8, purpose: PinPurpose, label: &'static str) -> Result<(), PinClaimError> {
        let slot = self
            .claims
            .get_mut(pin as usize)
            .ok_or(PinClaimError::OutOfRange(pin))?;
        if let Some(existing) = slot {
            return Err(PinClaimError::AlreadyClaimed {
                pin,
                existing: existing.purpose,
            });
        }
        *slot = Some(Claim { purpose, label });
        log::debug!("bio: claimed pin {pin} as {purpose:?} ({label})");
        Ok(())
    }

    pub fn release(&mut self, pin: u8) -> Result<(), PinClaimError> {
        let slot = self
            .claims
            .get_mut(pin as usize)
            .ok_or(PinClaimError::OutOfRange(pin))?;
        if slot.take().is_none() {
            return Err(PinClaimError::NotClaimed(pin));
        }
        self.backend.set_direction(pin, PinDirection::Input);
        Ok(())
    }

    /// Drops every claim and floats all pins. The safe-mode entry path.
    pub fn release_all(&mut self) {
        for pin in 0..BIO_PIN_COUNT as u8 {
            self.claims[pin as usize] = None;
            self.backend.set_direction(pin, PinDirection::Input);
        }
    }

    pub fn claimed_count(&self) -> usize {
        self.claims.iter().flatten().count()
    }

    pub fn purpose(&self, pin: u8) -> Option<PinPurpose> {
        self.claims.get(pin as usize)?.map(|claim| claim.purpose)
    }

    pub fn label(&self, pin: u8) -> Option<&'static str> {
        self.claims.get(pin as usize)?.map(|claim| claim.label)
    }

    // Electrical pass-through. Claims are not re-checked on the data path;
    // the sanity check before a syntax run is the enforcement point.

    #[inline]
    pub fn output(&mut self, pin: u8) {
        self.backend.set_direction(pin, PinDirection::Output);
    }

    #[inline]
    pub fn input(&mut self, pin: u8) {
        self.backend.set_direction(pin, PinDirection::Input);
    }

    #[inline]
    pub fn put(&mut self, pin: u8, high: bool) {
        self.backend.write(pin, PinState::from(high));
    }

    #[inline]
    pub fn get(&mut self, pin: u8) -> bool {
        self.backend.read(pin) == PinState::High
    }

    #[inline]
    pub fn read_all(&mut self) -> u8 {
        self.backend.read_all()
    }

    #[inline]
    pub fn write_masked(&mut self, mask: u8, value: u8) {
        self.backend.write_masked(mask, value);
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackPins;

    #[test]
    fn claim_conflicts_are_reported() {
        let mut bio = BioPins::new(LoopbackPins::new());
        bio.claim(0, PinPurpose::Mode, "SCLK").unwrap();
        assert_eq!(
            bio.claim(0, PinPurpose::Pwm, "PWM"),
            Err(PinClaimError::AlreadyClaimed {
                pin: 0,
                existing: PinPurpose::Mode
            })
        );
        assert_eq!(bio.claimed_count(), 1);
        bio.release(0).unwrap();
        assert_eq!(bio.release(0), Err(PinClaimError::NotClaimed(0)));
    }

    #[test]
    fn release_all_floats_every_pin() {
        let mut bio = BioPins::new(LoopbackPins::new());
        for pin in 0..4 {
            bio.claim(pin, PinPurpose::Io, "IO").unwrap();
            bio.output(pin);
            bio.put(pin, true);
        }
        bio.release_all();
        assert_eq!(bio.claimed_count(), 0);
        // Floating pins read back as the idle bus level.
        assert_eq!(bio.read_all(), 0xFF);
    }
}
