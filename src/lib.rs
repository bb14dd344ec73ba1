#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jbdbms_lib
//!
//! This crate polls JBD "smart BMS" battery monitors over Bluetooth Low Energy and
//! decodes their telemetry responses into typed events.
//!
//! The core is transport agnostic: a [`poller::DevicePoller`] drives any
//! [`transport::Connector`] through the hardware info / basic info / cell voltage
//! command cycle, reassembles notification fragments with a
//! [`accumulator::FrameAccumulator`] and hands decoded [`protocol::Event`]s to an
//! [`poller::EventSink`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `jbdbms` command-line tool.
//!
//! ### Transport Features
//! - `ble`: Enables the Bluetooth LE transport using the `bluest` crate.
//!
//! ### Utility Features
//! - `config`: Enables loading a YAML configuration file.
//! - `protocol_serde`: Enables `serde` support for the event types.
//! - `bin-dependencies`: Enables all features required by the `jbdbms` binary executable.

/// Reassembles notification fragments into candidate frames.
pub mod accumulator;
/// Contains error types for the library.
mod error;
/// Wire constants, event model and frame decoder.
pub mod protocol;
/// The per-device polling state machine.
pub mod poller;
/// The transport port the poller talks through.
pub mod transport;

pub use error::{DecodeOutcome, Error};

/// Bluetooth LE transport.
#[cfg_attr(docsrs, doc(cfg(feature = "ble")))]
#[cfg(feature = "ble")]
pub mod ble;

/// Configuration file support.
#[cfg_attr(docsrs, doc(cfg(feature = "config")))]
#[cfg(feature = "config")]
pub mod config;
