use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::config::{SerialConfig, TcpConfig, TransportConfig};
use crate::error::Error;

/// Timeout for one transport round-trip. Applied to the serial port and
/// to the TCP socket; the backend itself never retries.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A connected Modbus transport. Exactly one of these lives per backend
/// instance, and dropping it releases the underlying handle.
pub enum Transport {
    Tcp(TcpStream),
    Serial(Box<dyn serialport::SerialPort>),
}

impl Transport {
    pub fn connect(config: &TransportConfig) -> Result<Self, Error> {
        match config {
            TransportConfig::Tcp(tcp) => Self::connect_tcp(tcp),
            TransportConfig::Serial(serial) => Self::connect_serial(serial),
        }
    }

    fn connect_tcp(config: &TcpConfig) -> Result<Self, Error> {
        let endpoint = format!("{}:{}", config.host, config.port);
        log::info!("connecting to {endpoint} (unit {})", config.unit_id);

        let stream = TcpStream::connect(&endpoint).map_err(|err| Error::Connection {
            endpoint: endpoint.clone(),
            detail: normalize_connect_error(&err),
        })?;
        let configure = || -> io::Result<()> {
            stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
            stream.set_write_timeout(Some(RESPONSE_TIMEOUT))?;
            stream.set_nodelay(true)
        };
        configure().map_err(|err| Error::Connection {
            endpoint,
            detail: err.to_string(),
        })?;
        Ok(Transport::Tcp(stream))
    }

    fn connect_serial(config: &SerialConfig) -> Result<Self, Error> {
        log::info!(
            "connecting to {} (unit {}, baud {}, parity {:?}, data bits {:?}, stop bits {:?})",
            config.device,
            config.unit_id,
            config.baud_rate,
            config.parity,
            config.data_bits,
            config.stop_bits,
        );

        let port = serialport::new(&config.device, config.baud_rate)
            .timeout(RESPONSE_TIMEOUT)
            .parity(config.parity)
            .data_bits(config.data_bits)
            .stop_bits(config.stop_bits)
            .open()
            .map_err(|err| Error::Connection {
                endpoint: config.device.clone(),
                detail: err.to_string(),
            })?;
        Ok(Transport::Serial(port))
    }
}

/// Against an unreachable peer the OS alternates nondeterministically
/// between "connection refused" and "operation in progress"; both must
/// surface as the same condition.
fn normalize_connect_error(err: &io::Error) -> String {
    let text = err.to_string();
    if err.kind() == io::ErrorKind::ConnectionRefused || text.contains("in progress") {
        "connection refused".to_string()
    } else {
        text
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf),
            Transport::Serial(port) => port.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.write(buf),
            Transport::Serial(port) => port.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.flush(),
            Transport::Serial(port) => port.flush(),
        }
    }
}
