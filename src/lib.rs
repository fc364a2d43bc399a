//! # etee - Rust SDK for the etee finger-tracking hand controllers
//!
//! Cross-platform driver for the left/right controller pair behind the etee
//! RF dongle (a USB virtual serial port). Provides:
//! - Frame decoding: finger pressures, buttons, trackpad, gestures, battery
//! - IMU streaming with gyro bias correction and Madgwick sensor fusion
//! - The gyro/mag offset calibration protocols, including dongle bring-up
//! - Tap / double-tap detection on the trackpad
//!
//! ## Quick Start
//! ```no_run
//! use etee::{Device, Hand};
//!
//! let mut device = Device::open_first().unwrap();
//! loop {
//!     device.poll();
//!     if device.is_hand_connected(Hand::Right) {
//!         let q = device.quaternion(Hand::Right);
//!         println!("battery: {}  quat: {:?}", device.battery(Hand::Right), q);
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! ```

pub mod calibration;
pub mod decoder;
pub mod device;
pub mod error;
pub mod framer;
pub mod fusion;
pub mod gesture;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod types;

pub use calibration::CalibrationOutcome;
pub use device::{Config, Device};
pub use error::EteeError;
pub use stream::{StreamEvent, TelemetryStream};
pub use transport::{MockTransport, SerialTransport, Transport};
pub use types::*;

/// Result type alias for etee operations.
pub type Result<T> = std::result::Result<T, EteeError>;
