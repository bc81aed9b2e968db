//! Numeric-addressed register backend for Modbus RTU/TCP devices.
//!
//! This crate maps a flat, byte-addressed register space onto the four
//! Modbus address spaces (coils, discrete inputs, holding registers,
//! input registers). It owns a single connection, translates byte
//! ranges into protocol-correct register operations, and tracks a
//! tainted fault state that must be cleared through a verified
//! reconnect before further transfers are allowed.
//!
//! Wire framing and CRC handling are delegated to `rmodbus`; TCP uses
//! `std::net` and RTU uses `serialport`. The register-map file named in
//! the configuration is resolved by the host framework, not parsed
//! here.

pub mod backend;
pub mod config;
pub mod error;
pub mod registry;
pub mod space;

mod client;
mod transport;

pub use backend::{FaultRecord, ModbusBackend};
pub use config::{ModbusConfig, TransportConfig, TransportKind};
pub use error::{ConfigError, Error, LinkError};
pub use registry::BackendRegistry;
pub use space::AddressSpace;
