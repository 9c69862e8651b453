//! Per-tick device state as read from the platform.

/// State of one button at the moment of sampling.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ButtonSnapshot {
    pub pressed: bool,
    /// Analog pressure (0.0-1.0) for buttons that report one
    pub value: Option<f32>,
}

impl ButtonSnapshot {
    pub fn digital(pressed: bool) -> Self {
        Self {
            pressed,
            value: None,
        }
    }
}

/// Instantaneous state of one input device.
///
/// Created fresh on every sampler tick and never mutated afterwards. Axis values are
/// normalized to [-1, 1]; both sequences follow the standard gamepad order of the
/// backend that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    /// Stable slot index reported by the platform
    pub index: usize,
    /// Human readable device name
    pub id: String,
    pub axes: Vec<f32>,
    pub buttons: Vec<ButtonSnapshot>,
}

impl DeviceSnapshot {
    pub fn new(
        index: usize,
        id: impl Into<String>,
        axes: Vec<f32>,
        buttons: Vec<ButtonSnapshot>,
    ) -> Self {
        Self {
            index,
            id: id.into(),
            axes,
            buttons,
        }
    }
}

/// Emitted by the sampler when a device slot becomes occupied or empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub index: usize,
    pub id: String,
    /// `true` when the device appeared, `false` when it went away
    pub connecting: bool,
}
