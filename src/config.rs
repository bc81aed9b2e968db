use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serialport::{DataBits, Parity, StopBits};

use crate::error::ConfigError;

/// Default Modbus TCP port.
pub const DEFAULT_TCP_PORT: u16 = 502;
/// Default unit id on TCP (the Modbus TCP "don't care" slave address).
pub const DEFAULT_TCP_UNIT_ID: u8 = 255;
/// Serial line defaults: 115200 baud, no parity, 8 data bits, 1 stop bit.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_SERIAL_UNIT_ID: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Rtu,
}

impl TransportKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Rtu => "rtu",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub unit_id: u8,
}

#[derive(Debug, Clone)]
pub enum TransportConfig {
    Tcp(TcpConfig),
    Serial(SerialConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Tcp(_) => TransportKind::Tcp,
            TransportConfig::Serial(_) => TransportKind::Rtu,
        }
    }

    pub fn unit_id(&self) -> u8 {
        match self {
            TransportConfig::Tcp(tcp) => tcp.unit_id,
            TransportConfig::Serial(serial) => serial.unit_id,
        }
    }
}

/// Validated backend configuration, fixed for the lifetime of a backend
/// instance.
#[derive(Debug, Clone)]
pub struct ModbusConfig {
    pub transport: TransportConfig,
    /// Path of the register map file; resolved by the host framework, the
    /// backend only requires it to be present.
    pub map: String,
    /// Whether the framework may coalesce adjacent register requests into
    /// one transfer.
    pub merging_enabled: bool,
}

impl ModbusConfig {
    /// Build a configuration from the framework's string key/value
    /// options, validating once and applying the documented defaults.
    ///
    /// `address` is the host name for TCP or the device path for RTU.
    /// Unknown options are rejected, as are options belonging to the
    /// other transport kind (for example `baud` on a TCP connection).
    pub fn from_params(
        address: &str,
        params: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let map = params
            .get("map")
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingMap)?
            .clone();

        let kind = match params.get("type").map(String::as_str) {
            None | Some("") => return Err(ConfigError::MissingType),
            Some("tcp") => TransportKind::Tcp,
            Some("rtu") => TransportKind::Rtu,
            Some(other) => return Err(ConfigError::UnknownType(other.to_string())),
        };

        if address.is_empty() {
            return Err(ConfigError::MissingAddress);
        }

        for key in params.keys() {
            let allowed = match key.as_str() {
                "type" | "map" | "slaveid" | "disableMerging" => true,
                "port" => kind == TransportKind::Tcp,
                "baud" | "parity" | "databits" | "stopbits" => kind == TransportKind::Rtu,
                _ => return Err(ConfigError::UnknownOption(key.clone())),
            };
            if !allowed {
                return Err(ConfigError::MismatchedTransport {
                    key: key.clone(),
                    kind: kind.as_str(),
                });
            }
        }

        let transport = match kind {
            TransportKind::Tcp => TransportConfig::Tcp(TcpConfig {
                host: address.to_string(),
                port: parse_or(params, "port", DEFAULT_TCP_PORT)?,
                unit_id: parse_or(params, "slaveid", DEFAULT_TCP_UNIT_ID)?,
            }),
            TransportKind::Rtu => TransportConfig::Serial(SerialConfig {
                device: address.to_string(),
                baud_rate: parse_or(params, "baud", DEFAULT_BAUD_RATE)?,
                parity: parse_parity(params.get("parity"))?,
                data_bits: parse_data_bits(params.get("databits"))?,
                stop_bits: parse_stop_bits(params.get("stopbits"))?,
                unit_id: parse_or(params, "slaveid", DEFAULT_SERIAL_UNIT_ID)?,
            }),
        };

        // The legacy option is an integer flag: any non-zero value
        // disables merging.
        let disable_merging: i32 = parse_or(params, "disableMerging", 0)?;

        Ok(Self {
            transport,
            map,
            merging_enabled: disable_merging == 0,
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn unit_id(&self) -> u8 {
        self.transport.unit_id()
    }
}

fn parse_or<T>(
    params: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match params.get(key).filter(|value| !value.is_empty()) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
            key,
            value: value.clone(),
            reason: err.to_string(),
        }),
    }
}

fn parse_parity(value: Option<&String>) -> Result<Parity, ConfigError> {
    match value.map(String::as_str) {
        None | Some("") | Some("N") => Ok(Parity::None),
        Some("E") => Ok(Parity::Even),
        Some("O") => Ok(Parity::Odd),
        Some(other) => Err(ConfigError::InvalidValue {
            key: "parity",
            value: other.to_string(),
            reason: "expected N, E or O".to_string(),
        }),
    }
}

fn parse_data_bits(value: Option<&String>) -> Result<DataBits, ConfigError> {
    match value.map(String::as_str) {
        None | Some("") | Some("8") => Ok(DataBits::Eight),
        Some("7") => Ok(DataBits::Seven),
        Some("6") => Ok(DataBits::Six),
        Some("5") => Ok(DataBits::Five),
        Some(other) => Err(ConfigError::InvalidValue {
            key: "databits",
            value: other.to_string(),
            reason: "expected 5, 6, 7 or 8".to_string(),
        }),
    }
}

fn parse_stop_bits(value: Option<&String>) -> Result<StopBits, ConfigError> {
    match value.map(String::as_str) {
        None | Some("") | Some("1") => Ok(StopBits::One),
        Some("2") => Ok(StopBits::Two),
        Some(other) => Err(ConfigError::InvalidValue {
            key: "stopbits",
            value: other.to_string(),
            reason: "expected 1 or 2".to_string(),
        }),
    }
}
