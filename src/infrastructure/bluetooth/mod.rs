//! Bluetooth Module
//!
//! BLE link to the AR glasses: connection lifecycle, chunked file upload,
//! camera image download and one-shot commands.
//!
//! ## Architecture
//!
//! ```text
//!   LinkHandle (clone per caller)
//!        │ requests / replies
//!        ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   LinkService (actor)                    │
//! │  link state · registry · transfer slot · op queue        │
//! └──────┬──────────────┬──────────────┬────────────────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌────────────┐ ┌─────────────┐ ┌──────────────┐
//! │ Connection │ │   Upload    │ │ Acquisition  │
//! │ (connect   │ │ (name/start │ │ (takeimage/  │
//! │  sequence) │ │  update/end)│ │  getimage)   │
//! └────────────┘ └─────────────┘ └──────────────┘
//!        │
//!        ▼
//! ┌─────────────────────────────┐
//! │ GattTransport               │
//! │  btleplug (platform)        │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, control markers, statuses and commands
//! - [`registry`] - Logical channel to characteristic binding
//! - [`connection`] - Connect sequence state machine
//! - [`upload`] - Chunked upload state machine
//! - [`acquisition`] - Image download state machine
//! - [`command`] - Dispatcher commands
//! - [`service`] - Link actor and its handle
//! - [`transport`] - GATT transport trait
//! - [`platform`] - btleplug transport
//! - [`scanner`] - BLE device discovery

pub mod acquisition;
pub mod command;
pub mod connection;
pub mod error;
pub mod platform;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main service for convenience
pub use service::{LinkConfig, LinkHandle, LinkService};
