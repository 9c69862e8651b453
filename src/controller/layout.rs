//! Axis/button layout: which raw snapshot slot feeds which command field.

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AxisLayout {
    pub stick_x: usize,
    pub stick_y: usize,
    pub rotate: usize,
}

impl Default for AxisLayout {
    fn default() -> Self {
        Self {
            stick_x: 0,
            stick_y: 1,
            rotate: 2,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ButtonLayout {
    pub button_x: usize,
    pub button_y: usize,
    pub button_a: usize,
    pub button_b: usize,
}

impl Default for ButtonLayout {
    fn default() -> Self {
        Self {
            button_x: 0,
            button_y: 1,
            button_a: 2,
            button_b: 3,
        }
    }
}

/// Fixed mapping from semantic control names to snapshot indices.
///
/// Loaded once at startup and shared read-only by the encoder. `precision` is the
/// number of decimal places every axis field is rounded to before it goes on the wire.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Layout {
    pub axes: AxisLayout,
    pub buttons: ButtonLayout,
    pub precision: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            axes: AxisLayout::default(),
            buttons: ButtonLayout::default(),
            precision: 2,
        }
    }
}

impl Layout {
    /// Number of axes a snapshot needs for every axis field to resolve.
    pub fn required_axes(&self) -> usize {
        [self.axes.stick_x, self.axes.stick_y, self.axes.rotate]
            .into_iter()
            .max()
            .map_or(0, |i| i + 1)
    }

    /// Number of buttons a snapshot needs for every button field to resolve.
    pub fn required_buttons(&self) -> usize {
        [
            self.buttons.button_x,
            self.buttons.button_y,
            self.buttons.button_a,
            self.buttons.button_b,
        ]
        .into_iter()
        .max()
        .map_or(0, |i| i + 1)
    }
}
