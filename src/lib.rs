//! Control an addressable-LED fixture over a Bluetooth serial (RFCOMM) link.
//!
//! [`LedControlService`] keeps a link to a paired controller board alive,
//! mirrors the board's reported state in a [`DeviceState`], and sends
//! commands to it at a pace the board can handle.

pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::listeners::{LedControlListener, ListenerId};
pub use domain::models::{ConnectionState, DeviceState, LayerSettings, PatternInfo};
pub use infrastructure::bluetooth::{LedControlService, SendMode};
