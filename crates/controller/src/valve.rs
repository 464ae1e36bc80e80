//! Valve control via GPIO. The `gpio` feature gates the real rppal driver;
//! without it the simulated board is used, which only tracks pin state and
//! logs changes.

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Hardware collaborator: drives one relay per zone pin.
pub trait Valves: Send + Sync {
    /// Claim `pins` as outputs and make sure every one of them is OFF.
    /// Pins that are already set up are just switched OFF again.
    fn setup(&mut self, pins: &[u8]) -> Result<()>;

    fn energize(&mut self, pin: u8) -> Result<()>;

    fn de_energize(&mut self, pin: u8) -> Result<()>;

    fn is_energized(&self, pin: u8) -> bool;

    fn pins(&self) -> Vec<u8>;

    /// Switch every known pin OFF. Keeps going after a failure and reports
    /// the first one.
    fn de_energize_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for pin in self.pins() {
            if let Err(e) = self.de_energize(pin) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Build the board for this build: real GPIO with the `gpio` feature,
/// simulated otherwise.
pub fn board(active_low: bool) -> Result<Box<dyn Valves>> {
    #[cfg(feature = "gpio")]
    let board: Box<dyn Valves> = Box::new(GpioBoard::new(active_low)?);

    #[cfg(not(feature = "gpio"))]
    let board: Box<dyn Valves> = {
        info!(active_low, "[sim-gpio] no gpio feature, using simulated valve board");
        Box::new(SimulatedBoard::new())
    };

    Ok(board)
}

// ---------------------------------------------------------------------------
// Real GPIO valve board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct GpioBoard {
    gpio: Gpio,
    pins: BTreeMap<u8, OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl GpioBoard {
    pub fn new(active_low: bool) -> Result<Self> {
        Ok(Self {
            gpio: Gpio::new()?,
            pins: BTreeMap::new(),
            active_low,
        })
    }

    fn drive(&mut self, pin: u8, on: bool) -> Result<()> {
        let Some(out) = self.pins.get_mut(&pin) else {
            bail!("gpio {pin} was not set up");
        };
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            out.set_high();
        } else {
            out.set_low();
        }
        debug!(pin, on, "valve set");
        Ok(())
    }
}

#[cfg(feature = "gpio")]
impl Valves for GpioBoard {
    fn setup(&mut self, pins: &[u8]) -> Result<()> {
        for &pin in pins {
            if !self.pins.contains_key(&pin) {
                let out = self.gpio.get(pin)?.into_output();
                self.pins.insert(pin, out);
            }
            // Fail-safe: ensure "OFF" at startup
            self.drive(pin, false)?;
        }
        info!(pins = ?pins, active_low = self.active_low, "gpio valve board ready");
        Ok(())
    }

    fn energize(&mut self, pin: u8) -> Result<()> {
        self.drive(pin, true)
    }

    fn de_energize(&mut self, pin: u8) -> Result<()> {
        self.drive(pin, false)
    }

    fn is_energized(&self, pin: u8) -> bool {
        self.pins
            .get(&pin)
            .is_some_and(|out| out.is_set_high() != self.active_low)
    }

    fn pins(&self) -> Vec<u8> {
        self.pins.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Simulated valve board (development and tests, no hardware)
// ---------------------------------------------------------------------------
#[derive(Debug, Default)]
pub struct SimulatedBoard {
    pins: BTreeMap<u8, bool>, // pin -> energized
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn drive(&mut self, pin: u8, on: bool) -> Result<()> {
        let Some(state) = self.pins.get_mut(&pin) else {
            bail!("[sim-gpio] gpio {pin} was not set up");
        };
        *state = on;
        debug!(pin, on, "[sim-gpio] valve set");
        Ok(())
    }
}

impl Valves for SimulatedBoard {
    fn setup(&mut self, pins: &[u8]) -> Result<()> {
        for &pin in pins {
            self.pins.insert(pin, false);
        }
        info!(pins = ?pins, "[sim-gpio] valve board initialised (no hardware)");
        Ok(())
    }

    fn energize(&mut self, pin: u8) -> Result<()> {
        self.drive(pin, true)
    }

    fn de_energize(&mut self, pin: u8) -> Result<()> {
        self.drive(pin, false)
    }

    fn is_energized(&self, pin: u8) -> bool {
        self.pins.get(&pin).copied().unwrap_or(false)
    }

    fn pins(&self) -> Vec<u8> {
        self.pins.keys().copied().collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
