//! Bluetooth Module
//!
//! Serial (RFCOMM) link to the LED controller board.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   LedControlService                      │
//! │  (apply context - owns device state and the live link)   │
//! └──────┬──────────────┬──────────────┬────────────────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌──────────┐
//! │ Connector  │  │   Writer   │  │   Reader   │  │ Protocol │
//! │            │  │            │  │            │  │          │
//! │ - paired   │  │ - queue    │  │ - lines    │  │ - decode │
//! │   devices  │  │ - pacing   │  │ - close    │  │ - encode │
//! │ - fallback │  │ - coalesce │  │   signal   │  │ - speed  │
//! └────────────┘  └────────────┘  └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Line protocol, state deltas, and command encoding
//! - [`connector`] - Platform abstraction for finding and opening links
//! - [`writer`] - Paced outbound command queue
//! - [`reader`] - Inbound line reader
//! - [`service`] - Connection manager and public API
//! - `bluez` / `winrt` - Platform connector backends

pub mod connector;
pub mod protocol;
pub mod reader;
pub mod service;
pub mod writer;

#[cfg(unix)]
pub mod bluez;
#[cfg(windows)]
pub mod winrt;

pub use service::{LedControlService, SendMode};
