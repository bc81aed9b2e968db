use thiserror::Error;

use crate::space::AddressSpace;

/// Errors raised while building a backend configuration. These are fatal
/// and surface at construction time, before any connection is attempted.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("map file name not specified")]
    MissingMap,
    #[error("no modbus type (rtu/tcp) specified")]
    MissingType,
    #[error("unknown modbus type {0:?}, available types are rtu and tcp")]
    UnknownType(String),
    #[error("no device address specified")]
    MissingAddress,
    #[error("option {key} is not supported for a {kind} connection")]
    MismatchedTransport { key: String, kind: &'static str },
    #[error("unknown configuration option {0:?}")]
    UnknownOption(String),
    #[error("invalid value {value:?} for option {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown backend type {0:?}")]
    UnknownBackendType(String),
}

/// Failure of a single wire exchange, before it is attributed to an
/// address space and offset.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("modbus protocol error: {0}")]
    Protocol(#[from] rmodbus::ErrorKind),
    #[error("short transfer: requested {requested} units, device returned {returned}")]
    Short { requested: u16, returned: usize },
}

/// Runtime errors of an open backend.
///
/// `Transfer` faults taint the connection and are recoverable through a
/// verified reconnect; the remaining variants either reject the call
/// without touching the transport (`Closed`, `PriorFault`, `Broken`,
/// `ReadOnlySpace`, `AddressOutOfRange`) or report a failed `open()`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("device is not opened")]
    Closed,
    #[error("cannot connect to {endpoint}: {detail}")]
    Connection { endpoint: String, detail: String },
    #[error(
        "previous error detected on {space} at byte address {address:#x}, \
         reopen the device to recover"
    )]
    PriorFault { space: AddressSpace, address: u64 },
    #[error("device reported broken, reopen the device to recover")]
    Broken,
    #[error("writing to {space} is not supported")]
    ReadOnlySpace { space: AddressSpace },
    #[error("byte address {address:#x} does not fit the 16-bit address range of {space}")]
    AddressOutOfRange { space: AddressSpace, address: u64 },
    #[error("{op} of {space} at unit address {address} (count {count}) failed: {source}")]
    Transfer {
        op: &'static str,
        space: AddressSpace,
        address: u16,
        count: u16,
        #[source]
        source: LinkError,
    },
}
