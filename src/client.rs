use std::io::{Read, Write};

use rmodbus::{client::ModbusRequest, ModbusProto};

use crate::error::LinkError;
use crate::transport::Transport;

/// One Modbus client channel: owns the connected transport and performs
/// the request/response exchange for every register operation.
///
/// Frame generation and response validation are delegated to `rmodbus`;
/// this type only moves bytes and enforces that a response carries as
/// many units as were requested.
pub struct ModbusLink {
    transport: Transport,
    unit_id: u8,
    proto: ModbusProto,
}

impl ModbusLink {
    pub fn new(transport: Transport, unit_id: u8, proto: ModbusProto) -> Self {
        Self {
            transport,
            unit_id,
            proto,
        }
    }

    pub fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<u32>, LinkError> {
        let mut request = self.request();
        let mut raw = Vec::with_capacity(8);
        request.generate_get_coils(address, count, &mut raw)?;
        let response = self.transact(&raw)?;
        self.parse_bits(&mut request, &response, count)
    }

    pub fn read_discretes(&mut self, address: u16, count: u16) -> Result<Vec<u32>, LinkError> {
        let mut request = self.request();
        let mut raw = Vec::with_capacity(8);
        request.generate_get_discretes(address, count, &mut raw)?;
        let response = self.transact(&raw)?;
        self.parse_bits(&mut request, &response, count)
    }

    pub fn read_holdings(&mut self, address: u16, count: u16) -> Result<Vec<u32>, LinkError> {
        let mut request = self.request();
        let mut raw = Vec::with_capacity(8);
        request.generate_get_holdings(address, count, &mut raw)?;
        let response = self.transact(&raw)?;
        self.parse_registers(&mut request, &response, count)
    }

    pub fn read_inputs(&mut self, address: u16, count: u16) -> Result<Vec<u32>, LinkError> {
        let mut request = self.request();
        let mut raw = Vec::with_capacity(8);
        request.generate_get_inputs(address, count, &mut raw)?;
        let response = self.transact(&raw)?;
        self.parse_registers(&mut request, &response, count)
    }

    pub fn write_coil(&mut self, address: u16, value: bool) -> Result<(), LinkError> {
        let mut request = self.request();
        let mut raw = Vec::with_capacity(8);
        request.generate_set_coil(address, value, &mut raw)?;
        let response = self.transact(&raw)?;
        request.parse_ok(&response)?;
        Ok(())
    }

    pub fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<(), LinkError> {
        let mut request = self.request();
        let mut raw = Vec::with_capacity(16);
        request.generate_set_coils_bulk(address, values, &mut raw)?;
        let response = self.transact(&raw)?;
        request.parse_ok(&response)?;
        Ok(())
    }

    pub fn write_holding(&mut self, address: u16, value: u16) -> Result<(), LinkError> {
        let mut request = self.request();
        let mut raw = Vec::with_capacity(8);
        request.generate_set_holding(address, value, &mut raw)?;
        let response = self.transact(&raw)?;
        request.parse_ok(&response)?;
        Ok(())
    }

    pub fn write_holdings(&mut self, address: u16, values: &[u16]) -> Result<(), LinkError> {
        let mut request = self.request();
        let mut raw = Vec::with_capacity(16);
        request.generate_set_holdings_bulk(address, values, &mut raw)?;
        let response = self.transact(&raw)?;
        request.parse_ok(&response)?;
        Ok(())
    }

    fn request(&self) -> ModbusRequest {
        ModbusRequest::new(self.unit_id, self.proto)
    }

    fn transact(&mut self, raw: &[u8]) -> Result<Vec<u8>, LinkError> {
        log::trace!("send frame: {raw:02x?}");
        self.transport.write_all(raw)?;
        self.transport.flush()?;
        let response = self.read_response()?;
        log::trace!("received frame: {response:02x?}");
        Ok(response)
    }

    /// Bit responses come back eight to a byte; widen the first `count`
    /// of them into one 32-bit cell each.
    fn parse_bits(
        &self,
        request: &mut ModbusRequest,
        response: &[u8],
        count: u16,
    ) -> Result<Vec<u32>, LinkError> {
        let mut bits = Vec::with_capacity(count as usize);
        request.parse_bool(response, &mut bits)?;
        if bits.len() < count as usize {
            return Err(LinkError::Short {
                requested: count,
                returned: bits.len(),
            });
        }
        bits.truncate(count as usize);
        Ok(bits.into_iter().map(u32::from).collect())
    }

    /// Each 16-bit register becomes one 32-bit cell with the upper half
    /// zero-filled; order is preserved one-to-one.
    fn parse_registers(
        &self,
        request: &mut ModbusRequest,
        response: &[u8],
        count: u16,
    ) -> Result<Vec<u32>, LinkError> {
        let mut words = Vec::with_capacity(count as usize);
        request.parse_u16(response, &mut words)?;
        if words.len() < count as usize {
            return Err(LinkError::Short {
                requested: count,
                returned: words.len(),
            });
        }
        words.truncate(count as usize);
        Ok(words.into_iter().map(u32::from).collect())
    }

    /// Read exactly one response frame. The total length depends on the
    /// framing variant and the function code, so a short prefix is read
    /// first and the remainder sized from it.
    fn read_response(&mut self) -> Result<Vec<u8>, LinkError> {
        match self.proto {
            ModbusProto::TcpUdp => {
                let mut head = [0u8; 6];
                self.transport.read_exact(&mut head)?;
                let remaining = u16::from_be_bytes([head[4], head[5]]) as usize;
                let mut frame = vec![0u8; 6 + remaining];
                frame[..6].copy_from_slice(&head);
                self.transport.read_exact(&mut frame[6..])?;
                Ok(frame)
            }
            _ => {
                let mut head = [0u8; 3];
                self.transport.read_exact(&mut head)?;
                let total = rtu_frame_len(head[1], head[2]);
                let mut frame = vec![0u8; total];
                frame[..3].copy_from_slice(&head);
                self.transport.read_exact(&mut frame[3..])?;
                Ok(frame)
            }
        }
    }
}

/// Total RTU response length, given the function byte and the byte that
/// follows it: exception frames are fixed at 5 bytes, read responses
/// carry a byte count, write echoes are fixed at 8 bytes.
fn rtu_frame_len(func: u8, third: u8) -> usize {
    if func & 0x80 != 0 {
        5
    } else if (0x01..=0x04).contains(&func) {
        3 + third as usize + 2
    } else {
        8
    }
}
