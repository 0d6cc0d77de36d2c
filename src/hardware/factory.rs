//! Startup wiring: turn configured device definitions into a registry.
//!
//! A device that cannot be opened is registered in the `Failed` state rather
//! than aborting startup, so the remaining ports keep working and tasks for
//! the broken port are rejected with a clear reason.

use crate::config::{DeviceDefinition, DeviceKind, Settings};
use crate::error::AppResult;
use crate::hardware::capabilities::DeviceComponents;
use crate::hardware::mock::{SimulatedHvModule, SimulatedScpiSupply};
use crate::hardware::registry::{DeviceRegistry, RegisteredDevice};
use crate::hardware::scpi_supply::ScpiSupply;
use crate::hardware::serial_module::SerialHvModule;
use std::sync::Arc;
use tracing::{error, info};

/// Open every configured device (or its simulated twin in test mode) and
/// attach the temperature-donor pairings.
///
/// # Errors
/// Fails only on structural problems (duplicate ids, invalid pairings); a
/// device that cannot be opened is registered as `Failed`.
pub async fn build_registry(settings: &Settings) -> AppResult<DeviceRegistry> {
    let mut registry = DeviceRegistry::new();

    for definition in &settings.devices {
        let components = if settings.general.test_mode {
            simulated_components(definition)
        } else {
            open_components(definition, settings).await
        };

        registry.register(
            definition.id,
            RegisteredDevice::new(components)
                .with_label(definition.display_label())
                .with_max_voltage(definition.max_voltage),
        )?;
    }

    for pairing in &settings.pairings {
        registry.pair(pairing.primary, pairing.donor)?;
        info!(
            primary = pairing.primary,
            donor = pairing.donor,
            "Temperature donor pairing"
        );
    }

    let ready = registry.ready_ports();
    info!(
        configured = registry.len(),
        ready = ready.len(),
        test_mode = settings.general.test_mode,
        "Device registry built"
    );

    Ok(registry)
}

fn simulated_components(definition: &DeviceDefinition) -> DeviceComponents {
    let name = format!("{}", definition.id);
    match definition.kind {
        DeviceKind::SerialHv => {
            DeviceComponents::new().with_supply(Arc::new(SimulatedHvModule::new(&name)))
        }
        DeviceKind::ScpiPsu => {
            let supply = Arc::new(SimulatedScpiSupply::new(&name));
            DeviceComponents::new()
                .with_supply(supply.clone())
                .with_current_protection(supply)
        }
    }
}

async fn open_components(definition: &DeviceDefinition, settings: &Settings) -> DeviceComponents {
    match definition.kind {
        DeviceKind::SerialHv => {
            let module = open_serial(definition, settings);
            DeviceComponents::new().with_supply(Arc::new(module))
        }
        DeviceKind::ScpiPsu => {
            let supply = match ScpiSupply::connect(&definition.connection, &settings.scpi).await {
                Ok(supply) => supply,
                Err(e) => {
                    error!(
                        port_id = definition.id,
                        connection = %definition.connection,
                        error = %format!("{:#}", e),
                        "Could not open SCPI supply"
                    );
                    ScpiSupply::failed(&definition.connection)
                }
            };
            let supply = Arc::new(supply);
            DeviceComponents::new()
                .with_supply(supply.clone())
                .with_current_protection(supply)
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn open_serial(definition: &DeviceDefinition, settings: &Settings) -> SerialHvModule {
    match SerialHvModule::open(&definition.connection, &settings.serial) {
        Ok(module) => module,
        Err(e) => {
            error!(
                port_id = definition.id,
                connection = %definition.connection,
                error = %format!("{:#}", e),
                "Could not open serial HV module"
            );
            SerialHvModule::failed(&definition.connection)
        }
    }
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial(definition: &DeviceDefinition, _settings: &Settings) -> SerialHvModule {
    tracing::warn!(
        port_id = definition.id,
        connection = %definition.connection,
        "Serial support not compiled in (enable the instrument_serial feature)"
    );
    SerialHvModule::failed(&definition.connection)
}
