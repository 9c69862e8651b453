//! Snapshot → control command transform.
//!
//! Pure and stateless: the same snapshot and layout always produce the same command,
//! so the encoder can be called for any number of devices in the same tick.

use serde::{Deserialize, Serialize};

use super::layout::Layout;
use super::snapshot::DeviceSnapshot;

/// Event type tag of commands addressed to the chassis.
pub const CHASSIS_EVENT: &str = "chassis";

// Encoder errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("Axis field '{field}' maps to index {index}, device reports only {available} axes")]
    AxisOutOfRange {
        field: &'static str,
        index: usize,
        available: usize,
    },

    #[error("Button field '{field}' maps to index {index}, device reports only {available} buttons")]
    ButtonOutOfRange {
        field: &'static str,
        index: usize,
        available: usize,
    },
}

/// Normalized chassis fields carried inside a [`ControlCommand`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChassisPayload {
    pub stick: [f64; 2],
    pub button_x: bool,
    pub button_y: bool,
    pub button_a: bool,
    pub button_b: bool,
    pub rotate: f64,
}

/// Wire document published once per device per tick.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ControlCommand {
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub payload: ChassisPayload,
}

/// Highest precision honoured by [`round_to`], larger values are capped.
pub const MAX_PRECISION: u32 = 6;

/// Clamp to [-1, 1] and round to `decimals` places (at most [`MAX_PRECISION`]).
/// NaN becomes 0.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    // Kein i32-Überlauf, kein unendlicher Faktor
    let factor = 10f64.powi(decimals.min(MAX_PRECISION) as i32);
    let rounded = (value.clamp(-1.0, 1.0) * factor).round() / factor;
    // Avoid "-0.0" on the wire
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

pub fn encode(
    snapshot: &DeviceSnapshot,
    layout: &Layout,
    event_type: &str,
) -> Result<ControlCommand, EncodeError> {
    let axis = |field: &'static str, index: usize| -> Result<f64, EncodeError> {
        snapshot
            .axes
            .get(index)
            .map(|value| round_to(f64::from(*value), layout.precision))
            .ok_or(EncodeError::AxisOutOfRange {
                field,
                index,
                available: snapshot.axes.len(),
            })
    };
    let button = |field: &'static str, index: usize| -> Result<bool, EncodeError> {
        snapshot
            .buttons
            .get(index)
            .map(|button| button.pressed)
            .ok_or(EncodeError::ButtonOutOfRange {
                field,
                index,
                available: snapshot.buttons.len(),
            })
    };

    Ok(ControlCommand {
        event_type: event_type.to_string(),
        payload: ChassisPayload {
            stick: [
                axis("stick_x", layout.axes.stick_x)?,
                axis("stick_y", layout.axes.stick_y)?,
            ],
            button_x: button("button_x", layout.buttons.button_x)?,
            button_y: button("button_y", layout.buttons.button_y)?,
            button_a: button("button_a", layout.buttons.button_a)?,
            button_b: button("button_b", layout.buttons.button_b)?,
            rotate: axis("rotate", layout.axes.rotate)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::snapshot::ButtonSnapshot;

    fn snapshot(axes: Vec<f32>, pressed: &[bool]) -> DeviceSnapshot {
        let buttons = pressed.iter().map(|p| ButtonSnapshot::digital(*p)).collect();
        DeviceSnapshot::new(0, "Test Pad", axes, buttons)
    }

    fn is_two_decimal(value: f64) -> bool {
        ((value * 100.0).round() / 100.0 - value).abs() < 1e-12
    }

    #[test]
    fn encodes_default_layout() {
        let snap = snapshot(
            vec![0.12345, -0.98765, 0.5001, 0.3],
            &[true, false, true, false, true],
        );
        let cmd = encode(&snap, &Layout::default(), CHASSIS_EVENT).unwrap();

        assert_eq!(cmd.event_type, "chassis");
        assert_eq!(cmd.payload.stick, [0.12, -0.99]);
        assert_eq!(cmd.payload.rotate, 0.5);
        assert!(cmd.payload.button_x);
        assert!(!cmd.payload.button_y);
        assert!(cmd.payload.button_a);
        assert!(!cmd.payload.button_b);
    }

    #[test]
    fn encoding_is_deterministic_and_rounded() {
        let layout = Layout::default();
        for step in 0..=200 {
            let v = -1.0 + step as f32 * 0.0137;
            let snap = snapshot(vec![v, v / 3.0, -v], &[false; 4]);
            let first = encode(&snap, &layout, CHASSIS_EVENT).unwrap();
            let second = encode(&snap, &layout, CHASSIS_EVENT).unwrap();
            assert_eq!(first, second);
            assert!(is_two_decimal(first.payload.stick[0]));
            assert!(is_two_decimal(first.payload.stick[1]));
            assert!(is_two_decimal(first.payload.rotate));
        }
    }

    #[test]
    fn clamps_out_of_range_and_nan_axes() {
        let snap = snapshot(vec![1.7, f32::NAN, -3.0], &[false; 4]);
        let cmd = encode(&snap, &Layout::default(), CHASSIS_EVENT).unwrap();
        assert_eq!(cmd.payload.stick, [1.0, 0.0]);
        assert_eq!(cmd.payload.rotate, -1.0);
    }

    #[test]
    fn tiny_negative_values_do_not_serialize_as_negative_zero() {
        let snap = snapshot(vec![-0.001, 0.0, 0.0], &[false; 4]);
        let cmd = encode(&snap, &Layout::default(), CHASSIS_EVENT).unwrap();
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(!json.contains("-0.0"), "{json}");
    }

    #[test]
    fn oversized_precision_is_capped() {
        assert_eq!(round_to(0.123_456_789, 400), 0.123457);
        assert_eq!(round_to(-0.5, u32::MAX), -0.5);

        let layout = Layout {
            precision: 309,
            ..Layout::default()
        };
        let command = encode(&snapshot(vec![0.25, -0.75, 1.0], &[false; 4]), &layout, CHASSIS_EVENT)
            .unwrap();
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["payload"]["stick"], serde_json::json!([0.25, -0.75]));
        assert_eq!(json["payload"]["rotate"], serde_json::json!(1.0));
    }

    #[test]
    fn missing_axis_is_a_typed_error() {
        let snap = snapshot(vec![0.1, 0.2], &[false; 4]);
        let err = encode(&snap, &Layout::default(), CHASSIS_EVENT).unwrap_err();
        assert_eq!(
            err,
            EncodeError::AxisOutOfRange {
                field: "rotate",
                index: 2,
                available: 2
            }
        );
    }

    #[test]
    fn missing_button_is_a_typed_error() {
        let snap = snapshot(vec![0.0; 3], &[true, true]);
        let err = encode(&snap, &Layout::default(), CHASSIS_EVENT).unwrap_err();
        assert!(matches!(
            err,
            EncodeError::ButtonOutOfRange {
                field: "button_a",
                index: 2,
                available: 2
            }
        ));
    }

    #[test]
    fn wire_shape_matches_chassis_contract() {
        let snap = snapshot(vec![0.25, -0.5, 0.75], &[false, true, false, true]);
        let cmd = encode(&snap, &Layout::default(), CHASSIS_EVENT).unwrap();
        let value = serde_json::to_value(&cmd).unwrap();

        assert_eq!(value["eventType"], "chassis");
        assert_eq!(value["payload"]["stick"], serde_json::json!([0.25, -0.5]));
        assert_eq!(value["payload"]["button_y"], true);
        assert_eq!(value["payload"]["button_b"], true);
        assert_eq!(value["payload"]["rotate"], 0.75);
    }

    #[test]
    fn command_survives_wire_round_trip() {
        let snap = snapshot(vec![0.333, -0.777, 0.049], &[true, false, false, true]);
        let cmd = encode(&snap, &Layout::default(), CHASSIS_EVENT).unwrap();

        let wire = serde_json::to_vec(&cmd).unwrap();
        let decoded: ControlCommand = serde_json::from_slice(&wire).unwrap();

        assert_eq!(decoded.event_type, cmd.event_type);
        assert_eq!(
            (
                decoded.payload.button_x,
                decoded.payload.button_y,
                decoded.payload.button_a,
                decoded.payload.button_b
            ),
            (true, false, false, true)
        );
        for (got, want) in decoded
            .payload
            .stick
            .iter()
            .chain([decoded.payload.rotate].iter())
            .zip(cmd.payload.stick.iter().chain([cmd.payload.rotate].iter()))
        {
            assert!((got - want).abs() < 0.005, "{got} != {want}");
        }
    }
}
