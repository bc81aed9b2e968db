use std::collections::HashMap;

use crate::backend::ModbusBackend;
use crate::error::ConfigError;

/// Constructor signature for a registered backend type.
pub type BackendFactory =
    fn(address: &str, parameters: &HashMap<String, String>) -> Result<ModbusBackend, ConfigError>;

/// Explicit backend registry.
///
/// Backend types are registered by the application at startup instead of
/// from load-time constructors, so registration order and side effects
/// stay under caller control.
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `kind`, replacing any previous entry.
    pub fn register(&mut self, kind: &'static str, factory: BackendFactory) {
        log::info!("registered backend type {kind}");
        self.factories.insert(kind, factory);
    }

    /// Register the Modbus backend under its conventional name.
    pub fn register_modbus(&mut self) {
        self.register("modbus", ModbusBackend::from_params);
    }

    pub fn create(
        &self,
        kind: &str,
        address: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<ModbusBackend, ConfigError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ConfigError::UnknownBackendType(kind.to_string()))?;
        factory(address, parameters)
    }
}
