use std::fmt;

use strum::{EnumIter, FromRepr};

use crate::error::Error;

/// The four Modbus address spaces, tagged with the bar numbers used by
/// numeric-addressed register map files.
///
/// Coils and discrete inputs are bit-addressed, holding and input
/// registers are addressed in 16-bit words. Only coils and holding
/// registers accept writes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, FromRepr)]
pub enum AddressSpace {
    Coil = 0,
    DiscreteInput = 1,
    HoldingRegister = 3,
    InputRegister = 4,
}

impl AddressSpace {
    /// Resolve a raw bar number; `None` for anything outside the four
    /// supported spaces.
    pub fn from_bar(bar: u64) -> Option<Self> {
        u8::try_from(bar).ok().and_then(Self::from_repr)
    }

    pub fn bar(self) -> u64 {
        self as u64
    }

    /// Minimum transfer alignment in bytes: one 16-bit word for register
    /// spaces, one byte for bit spaces. Callers must align both the byte
    /// offset and the byte length of every transfer to this value.
    pub const fn alignment(self) -> usize {
        match self {
            Self::Coil | Self::DiscreteInput => 1,
            Self::HoldingRegister | Self::InputRegister => 2,
        }
    }

    pub const fn is_bit_addressed(self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }

    /// Convert a byte-addressed range into protocol units for this space.
    ///
    /// Register spaces divide by two, bit spaces pass through unchanged.
    /// A zero byte length normalizes to a single unit (the minimum
    /// transfer). Alignment is guaranteed by the framework contract and
    /// asserted here; a unit address or count beyond the 16-bit protocol
    /// range is reported as an error without touching the device.
    pub fn to_units(self, offset_bytes: u64, len_bytes: usize) -> Result<(u16, u16), Error> {
        let align = self.alignment() as u64;
        assert!(
            offset_bytes % align == 0,
            "byte offset {offset_bytes:#x} violates the {align}-byte alignment of {self}"
        );
        assert!(
            len_bytes as u64 % align == 0,
            "byte length {len_bytes} violates the {align}-byte alignment of {self}"
        );

        let unit_offset = u16::try_from(offset_bytes / align).map_err(|_| {
            Error::AddressOutOfRange {
                space: self,
                address: offset_bytes,
            }
        })?;
        let unit_count = (len_bytes as u64 / align).max(1);
        let unit_count = u16::try_from(unit_count).map_err(|_| Error::AddressOutOfRange {
            space: self,
            address: offset_bytes + len_bytes as u64,
        })?;
        Ok((unit_offset, unit_count))
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpace::Coil => write!(f, "coils"),
            AddressSpace::DiscreteInput => write!(f, "discrete inputs"),
            AddressSpace::HoldingRegister => write!(f, "holding registers"),
            AddressSpace::InputRegister => write!(f, "input registers"),
        }
    }
}
