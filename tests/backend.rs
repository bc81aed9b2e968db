//! End-to-end tests against an in-process Modbus TCP slave built from
//! `rmodbus`'s server types. The slave counts every request it receives
//! and can be switched into a faulty mode where it answers each request
//! with an exception frame.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use rmodbus::server::context::ModbusContext;
use rmodbus::server::storage::ModbusStorageSmall;
use rmodbus::server::ModbusFrame;
use rmodbus::ModbusProto;

use modbus_backend::{AddressSpace, Error, FaultRecord, ModbusBackend};

const UNIT_ID: u8 = 1;

struct TestSlave {
    port: u16,
    requests: Arc<AtomicUsize>,
    faulty: Arc<AtomicBool>,
    storage: Arc<Mutex<ModbusStorageSmall>>,
}

impl TestSlave {
    fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test slave");
        let port = listener.local_addr().expect("local addr").port();
        let requests = Arc::new(AtomicUsize::new(0));
        let faulty = Arc::new(AtomicBool::new(false));
        let storage = Arc::new(Mutex::new(ModbusStorageSmall::new()));

        {
            let requests = requests.clone();
            let faulty = faulty.clone();
            let storage = storage.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { continue };
                    serve_connection(stream, &requests, &faulty, &storage);
                }
            });
        }

        Self {
            port,
            requests,
            faulty,
            storage,
        }
    }

    fn backend(&self) -> ModbusBackend {
        let params: HashMap<String, String> = [
            ("type".to_string(), "tcp".to_string()),
            ("map".to_string(), "dev.map".to_string()),
            ("port".to_string(), self.port.to_string()),
            ("slaveid".to_string(), UNIT_ID.to_string()),
        ]
        .into_iter()
        .collect();
        ModbusBackend::from_params("127.0.0.1", &params).expect("valid test config")
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn set_faulty(&self, on: bool) {
        self.faulty.store(on, Ordering::SeqCst);
    }

    fn set_holding(&self, addr: u16, value: u16) {
        self.storage
            .lock()
            .unwrap()
            .set_holding(addr, value)
            .unwrap();
    }

    fn holding(&self, addr: u16) -> u16 {
        self.storage.lock().unwrap().get_holding(addr).unwrap()
    }

    fn coil(&self, addr: u16) -> bool {
        self.storage.lock().unwrap().get_coil(addr).unwrap()
    }

    fn set_coil(&self, addr: u16, value: bool) {
        self.storage.lock().unwrap().set_coil(addr, value).unwrap();
    }

    fn set_discrete(&self, addr: u16, value: bool) {
        self.storage
            .lock()
            .unwrap()
            .set_discrete(addr, value)
            .unwrap();
    }

    fn set_input(&self, addr: u16, value: u16) {
        self.storage.lock().unwrap().set_input(addr, value).unwrap();
    }
}

fn serve_connection(
    mut stream: TcpStream,
    requests: &AtomicUsize,
    faulty: &AtomicBool,
    storage: &Mutex<ModbusStorageSmall>,
) {
    loop {
        let mut head = [0u8; 6];
        if stream.read_exact(&mut head).is_err() {
            return;
        }
        let remaining = u16::from_be_bytes([head[4], head[5]]) as usize;
        let mut request = vec![0u8; 6 + remaining];
        request[..6].copy_from_slice(&head);
        if stream.read_exact(&mut request[6..]).is_err() {
            return;
        }
        requests.fetch_add(1, Ordering::SeqCst);

        let response = if faulty.load(Ordering::SeqCst) {
            exception_response(&request)
        } else {
            let mut response = Vec::new();
            let mut frame =
                ModbusFrame::new(UNIT_ID, &request, ModbusProto::TcpUdp, &mut response);
            if frame.parse().is_err() {
                return;
            }
            if frame.processing_required {
                let mut storage = storage.lock().unwrap();
                let result = if frame.readonly {
                    frame.process_read(&mut *storage)
                } else {
                    frame.process_write(&mut *storage)
                };
                if result.is_err() {
                    return;
                }
            }
            if !frame.response_required {
                continue;
            }
            if frame.finalize_response().is_err() {
                return;
            }
            response
        };

        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

/// Exception response to an arbitrary MBAP-framed request: same
/// transaction id and unit, function code with the error bit, exception
/// code 0x02 (illegal data address).
fn exception_response(request: &[u8]) -> Vec<u8> {
    let mut response = request[..8].to_vec();
    response[4] = 0;
    response[5] = 3;
    response[7] |= 0x80;
    response.push(0x02);
    response
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn read_returns_preloaded_register() -> Result<()> {
    init_logging();
    let slave = TestSlave::spawn();
    slave.set_holding(0, 3);

    let backend = slave.backend();
    backend.open()?;
    assert!(backend.is_functional());
    assert_eq!(backend.read(AddressSpace::HoldingRegister, 0, 2)?, vec![3]);
    Ok(())
}

#[test]
fn write_then_read_round_trip() -> Result<()> {
    let slave = TestSlave::spawn();
    let backend = slave.backend();
    backend.open()?;

    backend.write(AddressSpace::HoldingRegister, 0, &[7], 2)?;
    assert_eq!(slave.holding(0), 7);
    assert_eq!(backend.read(AddressSpace::HoldingRegister, 0, 2)?, vec![7]);
    Ok(())
}

#[test]
fn register_values_are_widened_with_upper_bits_zero() -> Result<()> {
    let slave = TestSlave::spawn();
    let backend = slave.backend();
    backend.open()?;

    let values = [0u32, 1, 0x7fff, 0x8000, 0xffff];
    backend.write(AddressSpace::HoldingRegister, 20, &values, values.len() * 2)?;
    let cells = backend.read(AddressSpace::HoldingRegister, 20, values.len() * 2)?;
    assert_eq!(cells, values);
    Ok(())
}

#[test]
fn single_unit_writes_use_the_single_element_primitive() -> Result<()> {
    let slave = TestSlave::spawn();
    let backend = slave.backend();
    backend.open()?;

    // One coil, one register: function codes 0x05 and 0x06 on the wire.
    backend.write(AddressSpace::Coil, 3, &[1], 1)?;
    assert!(slave.coil(3));
    backend.write(AddressSpace::HoldingRegister, 8, &[0xabcd_1234], 2)?;
    assert_eq!(slave.holding(4), 0x1234);

    assert_eq!(backend.read(AddressSpace::Coil, 3, 1)?, vec![1]);
    Ok(())
}

#[test]
fn bulk_coil_writes_round_trip() -> Result<()> {
    let slave = TestSlave::spawn();
    let backend = slave.backend();
    backend.open()?;

    let pattern = [1u32, 0, 1, 1, 0, 1];
    backend.write(AddressSpace::Coil, 10, &pattern, pattern.len())?;
    assert_eq!(
        backend.read(AddressSpace::Coil, 10, pattern.len())?,
        pattern
    );
    Ok(())
}

#[test]
fn discrete_inputs_and_input_registers_are_readable() -> Result<()> {
    let slave = TestSlave::spawn();
    slave.set_discrete(2, true);
    slave.set_discrete(3, false);
    slave.set_input(5, 0xbeef);

    let backend = slave.backend();
    backend.open()?;
    assert_eq!(backend.read(AddressSpace::DiscreteInput, 2, 2)?, vec![1, 0]);
    assert_eq!(
        backend.read(AddressSpace::InputRegister, 10, 2)?,
        vec![0xbeef]
    );
    Ok(())
}

#[test]
fn zero_byte_length_reads_one_unit() -> Result<()> {
    let slave = TestSlave::spawn();
    slave.set_holding(0, 42);
    slave.set_coil(0, true);

    let backend = slave.backend();
    backend.open()?;
    assert_eq!(backend.read(AddressSpace::HoldingRegister, 0, 0)?, vec![42]);
    assert_eq!(backend.read(AddressSpace::Coil, 0, 0)?, vec![1]);
    Ok(())
}

#[test]
fn zero_byte_length_writes_one_unit() -> Result<()> {
    let slave = TestSlave::spawn();
    let backend = slave.backend();
    backend.open()?;

    backend.write(AddressSpace::HoldingRegister, 0, &[9], 0)?;
    assert_eq!(slave.holding(0), 9);
    backend.write(AddressSpace::Coil, 4, &[1], 0)?;
    assert!(slave.coil(4));
    Ok(())
}

#[test]
fn writes_to_read_only_spaces_issue_no_transport_call() -> Result<()> {
    let slave = TestSlave::spawn();
    let backend = slave.backend();
    backend.open()?;

    let before = slave.requests();
    assert!(matches!(
        backend.write(AddressSpace::DiscreteInput, 0, &[1], 1),
        Err(Error::ReadOnlySpace { .. })
    ));
    assert!(matches!(
        backend.write(AddressSpace::InputRegister, 0, &[1], 2),
        Err(Error::ReadOnlySpace { .. })
    ));
    assert_eq!(slave.requests(), before);
    // The contract violation did not taint the connection.
    assert!(backend.is_functional());
    Ok(())
}

#[test]
fn fault_recovery_requires_one_verified_read() -> Result<()> {
    init_logging();
    let slave = TestSlave::spawn();
    slave.set_holding(0, 3);

    let backend = slave.backend();
    backend.open()?;
    assert_eq!(backend.read(AddressSpace::HoldingRegister, 0, 2)?, vec![3]);

    // Every request now answers with an exception frame.
    slave.set_faulty(true);
    let err = backend
        .read(AddressSpace::HoldingRegister, 0, 2)
        .unwrap_err();
    assert!(matches!(err, Error::Transfer { .. }));
    assert!(!backend.is_functional());
    assert_eq!(
        backend.last_fault(),
        Some(FaultRecord {
            space: AddressSpace::HoldingRegister,
            address: 0
        })
    );

    // Fast-fail without touching the transport while the fault stands.
    let before = slave.requests();
    let err = backend
        .read(AddressSpace::HoldingRegister, 0, 2)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::PriorFault {
            space: AddressSpace::HoldingRegister,
            address: 0
        }
    ));
    assert_eq!(slave.requests(), before);

    // Reopening while the device still faults keeps the taint.
    assert!(backend.open().is_err());
    assert!(!backend.is_functional());

    // Once the device recovers, open() issues exactly one verification
    // read at the failed address and clears the fault.
    slave.set_faulty(false);
    let before = slave.requests();
    backend.open()?;
    assert_eq!(slave.requests(), before + 1);
    assert!(backend.is_functional());
    assert_eq!(backend.last_fault(), None);
    assert_eq!(backend.read(AddressSpace::HoldingRegister, 0, 2)?, vec![3]);
    Ok(())
}

#[test]
fn bit_space_faults_verify_with_a_single_bit_read() -> Result<()> {
    let slave = TestSlave::spawn();
    slave.set_coil(5, true);

    let backend = slave.backend();
    backend.open()?;

    slave.set_faulty(true);
    assert!(backend.read(AddressSpace::Coil, 5, 1).is_err());
    slave.set_faulty(false);

    backend.open()?;
    assert_eq!(backend.read(AddressSpace::Coil, 5, 1)?, vec![1]);
    Ok(())
}

#[test]
fn failed_writes_taint_the_connection_too() -> Result<()> {
    let slave = TestSlave::spawn();
    let backend = slave.backend();
    backend.open()?;

    slave.set_faulty(true);
    let err = backend
        .write(AddressSpace::HoldingRegister, 6, &[9], 2)
        .unwrap_err();
    assert!(matches!(err, Error::Transfer { op: "write", .. }));
    assert!(matches!(
        backend.read(AddressSpace::HoldingRegister, 0, 2),
        Err(Error::PriorFault {
            space: AddressSpace::HoldingRegister,
            address: 6
        })
    ));

    slave.set_faulty(false);
    backend.open()?;
    backend.write(AddressSpace::HoldingRegister, 6, &[9], 2)?;
    assert_eq!(slave.holding(3), 9);
    Ok(())
}

#[test]
fn concurrent_transfers_are_serialized() -> Result<()> {
    let slave = TestSlave::spawn();
    let backend = Arc::new(slave.backend());
    backend.open()?;

    thread::scope(|scope| {
        for worker in 0u32..8 {
            let backend = backend.clone();
            scope.spawn(move || {
                let address = u64::from(worker) * 2;
                for round in 0u32..10 {
                    let value = 1000 + worker * 100 + round;
                    backend
                        .write(AddressSpace::HoldingRegister, address, &[value], 2)
                        .expect("write");
                    let cells = backend
                        .read(AddressSpace::HoldingRegister, address, 2)
                        .expect("read");
                    assert_eq!(cells, vec![value]);
                }
            });
        }
    });

    // 8 workers x 10 rounds x (one write + one read)
    assert_eq!(slave.requests(), 160);
    Ok(())
}

#[test]
fn connect_to_a_dead_port_is_reported_as_refused() {
    // Grab a free port and close the listener again.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let params: HashMap<String, String> = [
        ("type".to_string(), "tcp".to_string()),
        ("map".to_string(), "dev.map".to_string()),
        ("port".to_string(), port.to_string()),
    ]
    .into_iter()
    .collect();
    let backend = ModbusBackend::from_params("127.0.0.1", &params).unwrap();

    match backend.open().unwrap_err() {
        Error::Connection { detail, .. } => assert_eq!(detail, "connection refused"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!backend.is_functional());
}

#[test]
fn open_on_a_missing_serial_device_fails() {
    let params: HashMap<String, String> = [
        ("type".to_string(), "rtu".to_string()),
        ("map".to_string(), "dev.map".to_string()),
    ]
    .into_iter()
    .collect();
    let backend =
        ModbusBackend::from_params("/dev/modbus-backend-test-missing", &params).unwrap();
    assert!(matches!(
        backend.open().unwrap_err(),
        Error::Connection { .. }
    ));
}

#[test]
fn close_then_open_reconnects() -> Result<()> {
    let slave = TestSlave::spawn();
    slave.set_holding(1, 11);

    let backend = slave.backend();
    backend.open()?;
    assert_eq!(backend.read(AddressSpace::HoldingRegister, 2, 2)?, vec![11]);

    backend.close();
    assert!(!backend.is_functional());
    assert!(matches!(
        backend.read(AddressSpace::HoldingRegister, 2, 2),
        Err(Error::Closed)
    ));

    backend.open()?;
    assert_eq!(backend.read(AddressSpace::HoldingRegister, 2, 2)?, vec![11]);
    Ok(())
}

#[test]
fn forced_exception_drops_the_connection() -> Result<()> {
    let slave = TestSlave::spawn();
    let backend = slave.backend();
    backend.open()?;
    assert!(backend.is_functional());

    backend.set_exception();
    assert!(!backend.is_functional());
    assert!(matches!(
        backend.read(AddressSpace::HoldingRegister, 0, 2),
        Err(Error::Broken)
    ));

    // Recovery is a plain reconnect; no fault address was recorded.
    backend.open()?;
    assert!(backend.is_functional());
    backend.read(AddressSpace::HoldingRegister, 0, 2)?;
    Ok(())
}

#[test]
fn merging_policy_is_fixed_at_construction() {
    let slave = TestSlave::spawn();
    assert!(slave.backend().can_merge_requests());

    let params: HashMap<String, String> = [
        ("type".to_string(), "tcp".to_string()),
        ("map".to_string(), "dev.map".to_string()),
        ("disableMerging".to_string(), "1".to_string()),
    ]
    .into_iter()
    .collect();
    let backend = ModbusBackend::from_params("127.0.0.1", &params).unwrap();
    assert!(!backend.can_merge_requests());
}
