use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rmodbus::ModbusProto;

use crate::client::ModbusLink;
use crate::config::{ModbusConfig, TransportConfig, TransportKind};
use crate::error::{ConfigError, Error};
use crate::space::AddressSpace;
use crate::transport::Transport;

/// Location of the most recent failed transfer. Present only while the
/// connection is tainted; cleared when a verification read at this
/// location succeeds during `open()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub space: AddressSpace,
    /// Byte address, as passed by the caller (not unit-converted).
    pub address: u64,
}

#[derive(Default)]
struct LinkState {
    link: Option<ModbusLink>,
    opened: bool,
    last_failed: Option<FaultRecord>,
}

/// Stateful Modbus backend mapping a flat, byte-addressed register space
/// onto coils, discrete inputs, holding registers and input registers
/// over a single TCP or RTU connection.
///
/// All transfers are serialized through one per-instance lock; a failed
/// transfer taints the connection and every further transfer is rejected
/// until [`open`](Self::open) re-verifies the link with a read at the
/// failed address.
pub struct ModbusBackend {
    config: ModbusConfig,
    state: Mutex<LinkState>,
    /// Set by transfer faults and by the framework's forced-exception
    /// notifier, which may run concurrently with an in-flight transfer.
    active_exception: AtomicBool,
}

impl std::fmt::Debug for ModbusBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusBackend")
            .field("config", &self.config)
            .field(
                "active_exception",
                &self.active_exception.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl ModbusBackend {
    pub fn new(config: ModbusConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LinkState::default()),
            active_exception: AtomicBool::new(false),
        }
    }

    /// Factory entry point matching the host framework's
    /// `(address, parameters)` construction contract.
    pub fn from_params(
        address: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(ModbusConfig::from_params(address, parameters)?))
    }

    /// Open the connection, or recover an already-open one.
    ///
    /// On a closed backend this connects the transport. On an open
    /// backend it clears the exception state and, if a transfer fault is
    /// recorded, verifies the link with a dummy read at the failed
    /// address before declaring the connection healthy; the fault record
    /// survives a failed verification.
    pub fn open(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.opened {
            self.active_exception.store(false, Ordering::SeqCst);
            if let Some(fault) = state.last_failed {
                let size = fault.space.alignment();
                self.transfer_read(&mut state, fault.space, fault.address, size)?;
                state.last_failed = None;
                log::info!(
                    "recovered after fault on {} at byte address {:#x}",
                    fault.space,
                    fault.address
                );
            }
            return Ok(());
        }

        let transport = Transport::connect(&self.config.transport)?;
        let proto = match self.config.kind() {
            TransportKind::Tcp => ModbusProto::TcpUdp,
            TransportKind::Rtu => ModbusProto::Rtu,
        };
        state.link = Some(ModbusLink::new(transport, self.config.unit_id(), proto));
        state.opened = true;
        self.active_exception.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Close the connection. Idempotent. The fault record is retained
    /// across close/open cycles, so a later `open()` on a reopened
    /// instance still verifies the failed address.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.opened {
            state.opened = false;
            state.link = None;
            log::info!("closed {}", self.device_info());
        }
    }

    /// Forced-exception notifier: the framework signals that the device
    /// must be considered broken. Drops the connection immediately; the
    /// next `open()` reconnects from scratch.
    pub fn set_exception(&self) {
        self.active_exception.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.opened = false;
        state.link = None;
        log::warn!("{} reported broken, connection dropped", self.device_info());
    }

    /// Read `size_bytes` starting at byte address `address`, one protocol
    /// unit per returned cell: bits come back as 0/1, registers widened
    /// into the low 16 bits. A zero size reads one unit.
    pub fn read(
        &self,
        space: AddressSpace,
        address: u64,
        size_bytes: usize,
    ) -> Result<Vec<u32>, Error> {
        self.reject_if_tainted()?;
        log::debug!("read {space} at byte address {address:#x}, {size_bytes} bytes");
        let mut state = self.state.lock();
        self.transfer_read(&mut state, space, address, size_bytes)
    }

    /// Write `size_bytes` starting at byte address `address`, taking one
    /// protocol unit from each cell: a non-zero cell sets a coil, the low
    /// 16 bits of a cell set a holding register. Only coils and holding
    /// registers are writable. A zero size writes one unit, so `data`
    /// must hold at least one cell even then; like the alignment rules,
    /// the buffer size is a caller contract and is asserted.
    pub fn write(
        &self,
        space: AddressSpace,
        address: u64,
        data: &[u32],
        size_bytes: usize,
    ) -> Result<(), Error> {
        self.reject_if_tainted()?;
        log::debug!("write {space} at byte address {address:#x}, {size_bytes} bytes");
        let mut state = self.state.lock();

        if !space.is_writable() {
            return Err(Error::ReadOnlySpace { space });
        }
        let (unit_address, count) = space.to_units(address, size_bytes)?;
        assert!(
            data.len() >= count as usize,
            "data buffer holds fewer than {count} cells"
        );
        let cells = &data[..count as usize];
        let link = state.link.as_mut().ok_or(Error::Closed)?;

        let result = match space {
            AddressSpace::Coil => {
                if count == 1 {
                    link.write_coil(unit_address, cells[0] != 0)
                } else {
                    let bits: Vec<bool> = cells.iter().map(|cell| *cell != 0).collect();
                    link.write_coils(unit_address, &bits)
                }
            }
            AddressSpace::HoldingRegister => {
                if count == 1 {
                    link.write_holding(unit_address, narrow_cell(cells[0]))
                } else {
                    let words: Vec<u16> = cells.iter().copied().map(narrow_cell).collect();
                    link.write_holdings(unit_address, &words)
                }
            }
            AddressSpace::DiscreteInput | AddressSpace::InputRegister => {
                unreachable!("read-only spaces are rejected above")
            }
        };

        result.map_err(|cause| {
            log::warn!("failed writing {space} at unit address {unit_address} (count {count})");
            state.last_failed = Some(FaultRecord { space, address });
            self.active_exception.store(true, Ordering::SeqCst);
            Error::Transfer {
                op: "write",
                space,
                address: unit_address,
                count,
                source: cause,
            }
        })
    }

    /// Whether the framework may coalesce adjacent register requests into
    /// one transfer. Fixed at construction.
    pub fn can_merge_requests(&self) -> bool {
        self.config.merging_enabled
    }

    /// Minimum transfer alignment in bytes for `space`.
    pub fn minimum_transfer_alignment(&self, space: AddressSpace) -> usize {
        space.alignment()
    }

    /// Whether a raw bar number names one of the supported address
    /// spaces.
    pub fn bar_index_valid(bar: u64) -> bool {
        AddressSpace::from_bar(bar).is_some()
    }

    /// Open, and no fault outstanding.
    pub fn is_functional(&self) -> bool {
        self.state.lock().opened && !self.active_exception.load(Ordering::SeqCst)
    }

    /// Location of the outstanding transfer fault, if any. Cleared only
    /// by a successful verification read during [`open`](Self::open).
    pub fn last_fault(&self) -> Option<FaultRecord> {
        self.state.lock().last_failed
    }

    pub fn device_info(&self) -> String {
        match &self.config.transport {
            TransportConfig::Tcp(tcp) => format!(
                "modbus tcp device {}:{} (unit {})",
                tcp.host, tcp.port, tcp.unit_id
            ),
            TransportConfig::Serial(serial) => format!(
                "modbus rtu device {} (baud {}, unit {})",
                serial.device, serial.baud_rate, serial.unit_id
            ),
        }
    }

    pub fn config(&self) -> &ModbusConfig {
        &self.config
    }

    /// Fast-fail while a fault is outstanding, so a new unrelated error
    /// cannot mask it. Checked before the transfer lock is taken and
    /// without touching the transport.
    fn reject_if_tainted(&self) -> Result<(), Error> {
        if !self.active_exception.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.state.lock().last_failed {
            Some(fault) => Err(Error::PriorFault {
                space: fault.space,
                address: fault.address,
            }),
            None => Err(Error::Broken),
        }
    }

    fn transfer_read(
        &self,
        state: &mut LinkState,
        space: AddressSpace,
        address: u64,
        size_bytes: usize,
    ) -> Result<Vec<u32>, Error> {
        let (unit_address, count) = space.to_units(address, size_bytes)?;
        let link = state.link.as_mut().ok_or(Error::Closed)?;

        let result = match space {
            AddressSpace::Coil => link.read_coils(unit_address, count),
            AddressSpace::DiscreteInput => link.read_discretes(unit_address, count),
            AddressSpace::HoldingRegister => link.read_holdings(unit_address, count),
            AddressSpace::InputRegister => link.read_inputs(unit_address, count),
        };

        result.map_err(|cause| {
            log::warn!("failed reading {space} at unit address {unit_address} (count {count})");
            state.last_failed = Some(FaultRecord { space, address });
            self.active_exception.store(true, Ordering::SeqCst);
            Error::Transfer {
                op: "read",
                space,
                address: unit_address,
                count,
                source: cause,
            }
        })
    }
}

impl Drop for ModbusBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Low 16 bits of a cell, as written to a register.
fn narrow_cell(cell: u32) -> u16 {
    (cell & 0xffff) as u16
}
