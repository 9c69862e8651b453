//! Controller subsystem for gamepad input handling
//!
//! Turns attached gamepads into control commands in three stages:
//!
//! 1. [`source`] - Platform boundary, one [`snapshot::DeviceSnapshot`] per occupied slot
//! 2. [`sampler`] - Fixed-cadence polling, device connect/disconnect tracking
//! 3. [`encoder`] - Snapshot to wire command through a [`layout::Layout`]
//!
//! # Architecture
//!
//! ```text
//! Gamepad ──► DeviceSource ──► DeviceSampler ──► SnapshotSink ──► encode()
//!             (gilrs)          (100ms ticks)     (bridge)         (ControlCommand)
//! ```

pub mod encoder;
pub mod layout;
pub mod sampler;
pub mod snapshot;
pub mod source;

pub use encoder::{encode, ControlCommand, EncodeError};
pub use layout::Layout;
pub use sampler::{DeviceSampler, SnapshotSink};
pub use snapshot::{ButtonSnapshot, DeviceEvent, DeviceSnapshot};
pub use source::{DeviceSource, GamepadSource, SourceError};
