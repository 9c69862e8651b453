use gilrs::{Axis, Button, Event, EventType, Gamepad, Gilrs};
use statum::{machine, state};
use tracing::{debug, error, info, warn};

use super::snapshot::{ButtonSnapshot, DeviceSnapshot};

// Source errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to initialize device backend: {0}")]
    InitializationError(String),

    #[error("Failed to poll devices: {0}")]
    PollError(String),
}

/// Platform boundary of the sampler.
///
/// `poll` returns one entry per device slot; empty slots are `None`. Implementations
/// must not block.
pub trait DeviceSource: Send {
    fn poll(&mut self) -> Result<Vec<Option<DeviceSnapshot>>, SourceError>;
}

// Axis order of the standard gamepad mapping
const AXES: [Axis; 6] = [
    Axis::LeftStickX,
    Axis::LeftStickY,
    Axis::RightStickX,
    Axis::RightStickY,
    Axis::LeftZ,
    Axis::RightZ,
];

// Button order of the standard gamepad mapping
const BUTTONS: [Button; 17] = [
    Button::South,
    Button::East,
    Button::West,
    Button::North,
    Button::LeftTrigger,
    Button::RightTrigger,
    Button::LeftTrigger2,
    Button::RightTrigger2,
    Button::Select,
    Button::Start,
    Button::LeftThumb,
    Button::RightThumb,
    Button::DPadUp,
    Button::DPadDown,
    Button::DPadLeft,
    Button::DPadRight,
    Button::Mode,
];

#[state]
#[derive(Debug, Clone)]
pub enum SourceState {
    Probing,
    Ready,
}

/// Gamepad backend built on gilrs.
#[machine]
#[derive(Debug)]
pub struct GamepadSource<S: SourceState> {
    gilrs: Gilrs,
    deadzone: f32,
}

impl GamepadSource<Probing> {
    pub fn create(deadzone: f32) -> Result<Self, SourceError> {
        info!("Initializing gilrs controller interface");
        let gilrs = match Gilrs::new() {
            Ok(g) => {
                info!("Successfully initialized gilrs");
                g
            }
            Err(e) => {
                error!("Failed to initialize gilrs: {}", e);
                return Err(SourceError::InitializationError(e.to_string()));
            }
        };

        Ok(Self::new(gilrs, deadzone))
    }

    // Log what is attached right now and become ready for polling
    pub fn initialize(self) -> GamepadSource<Ready> {
        let gamepads: Vec<_> = self.gilrs.gamepads().collect();
        if gamepads.is_empty() {
            warn!("No gamepad connected, sampling idle slots until one appears");
        } else {
            info!("Found {} gamepads:", gamepads.len());
            for (id, gamepad) in &gamepads {
                info!(
                    "  [{}] Name: {}, UUID: {:?}",
                    usize::from(*id),
                    gamepad.name(),
                    gamepad.uuid()
                );
            }
        }

        self.transition()
    }
}

impl GamepadSource<Ready> {
    fn snapshot(&self, index: usize, gamepad: &Gamepad<'_>) -> DeviceSnapshot {
        let axes = AXES
            .iter()
            .map(|axis| {
                let value = apply_deadzone(gamepad.value(*axis), self.deadzone);
                // gilrs reports stick-up as positive, the standard mapping as negative
                match axis {
                    Axis::LeftStickY | Axis::RightStickY => -value,
                    _ => value,
                }
            })
            .collect();

        let buttons = BUTTONS
            .iter()
            .map(|button| ButtonSnapshot {
                pressed: gamepad.is_pressed(*button),
                value: gamepad.button_data(*button).map(|data| data.value()),
            })
            .collect();

        DeviceSnapshot::new(index, gamepad.name(), axes, buttons)
    }
}

impl DeviceSource for GamepadSource<Ready> {
    fn poll(&mut self) -> Result<Vec<Option<DeviceSnapshot>>, SourceError> {
        // Ausstehende Events abholen, damit der Gamepad-Zustand aktuell ist
        while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
            match event {
                EventType::Connected => info!("Gamepad {} connected", usize::from(id)),
                EventType::Disconnected => warn!("Gamepad {} disconnected", usize::from(id)),
                _ => {}
            }
        }

        let mut slots: Vec<Option<DeviceSnapshot>> = Vec::new();
        for (id, gamepad) in self.gilrs.gamepads() {
            let index = usize::from(id);
            if slots.len() <= index {
                slots.resize(index + 1, None);
            }
            slots[index] = Some(self.snapshot(index, &gamepad));
        }

        debug!(
            "Polled {} gamepad slots, {} occupied",
            slots.len(),
            slots.iter().flatten().count()
        );
        Ok(slots)
    }
}

// Helper function to apply deadzone to analog stick values
pub fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if value.abs() < deadzone {
        0.0
    } else {
        // Rescale the value to the range outside the deadzone
        let sign = if value < 0.0 { -1.0 } else { 1.0 };
        sign * (value.abs() - deadzone) / (1.0 - deadzone)
    }
}
