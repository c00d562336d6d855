//! Device discovery and capability reporting.
//!
//! Device inventory is an explicit value passed to configuration validation
//! and stage construction, never ambient global state. Production code uses
//! [`HostProbe`]; tests inject an inventory of their own making.

/// Capabilities of a single imaging device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Device id, dense from 0.
    pub id: u32,
    /// Maximum number of output channels the device can image at once.
    pub max_channels: u32,
    /// Maximum support size (kernel half-width), bounded by per-device
    /// shared memory.
    pub max_support: u32,
}

/// The set of devices available to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct DeviceInventory {
    devices: Vec<DeviceCaps>,
}

impl DeviceInventory {
    /// Build an inventory from explicit capability entries.
    pub fn new(devices: Vec<DeviceCaps>) -> Self {
        Self { devices }
    }

    /// An inventory of `count` identical devices with the given caps.
    pub fn uniform(count: u32, max_channels: u32, max_support: u32) -> Self {
        Self {
            devices: (0..count)
                .map(|id| DeviceCaps {
                    id,
                    max_channels,
                    max_support,
                })
                .collect(),
        }
    }

    /// Number of available devices.
    pub fn count(&self) -> u32 {
        self.devices.len() as u32
    }

    /// Capabilities of device `id`, if present.
    pub fn caps(&self, id: u32) -> Option<&DeviceCaps> {
        self.devices.get(id as usize)
    }

    /// Iterate over all devices.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceCaps> {
        self.devices.iter()
    }

    /// The smallest channel cap across devices (0 if none).
    pub fn min_channel_cap(&self) -> u32 {
        self.devices
            .iter()
            .map(|d| d.max_channels)
            .min()
            .unwrap_or(0)
    }

    /// The smallest support cap across devices (0 if none).
    pub fn min_support_cap(&self) -> u32 {
        self.devices.iter().map(|d| d.max_support).min().unwrap_or(0)
    }
}

/// Provider of the device inventory.
///
/// Injected into validation so the core stays testable without real devices.
pub trait DeviceProbe {
    /// Enumerate the devices visible to this process.
    fn inventory(&self) -> DeviceInventory;
}

/// Default channel cap advertised by [`HostProbe`].
pub const HOST_MAX_CHANNELS: u32 = 132;
/// Default support cap advertised by [`HostProbe`].
pub const HOST_MAX_SUPPORT: u32 = 32;

/// Probe for the host process.
///
/// Reports one device per configured worker slot. Without real device
/// enumeration this is a single CPU-backed device; deployments with
/// accelerators substitute their own probe.
#[derive(Debug, Clone)]
pub struct HostProbe {
    ndevices: u32,
}

impl HostProbe {
    /// A probe reporting `ndevices` identical host devices.
    pub fn new(ndevices: u32) -> Self {
        Self { ndevices }
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self { ndevices: 1 }
    }
}

impl DeviceProbe for HostProbe {
    fn inventory(&self) -> DeviceInventory {
        DeviceInventory::uniform(self.ndevices, HOST_MAX_CHANNELS, HOST_MAX_SUPPORT)
    }
}
