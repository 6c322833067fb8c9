use crate::error::MediaError;
use cpal::traits::{DeviceTrait, HostTrait};

/// Capability probe for routing call audio to a loudspeaker-class output.
///
/// Routing is best-effort by contract: platforms that cannot retarget an
/// open output stream report `supports_routing() == false` and
/// `set_loudspeaker` returns `Ok(false)`, telling the caller to fall back
/// to a visual-only toggle.
pub trait OutputRoute: Send + Sync + 'static {
    fn supports_routing(&self) -> bool;

    /// Attempts to (un)route output to the loudspeaker. `Ok(true)` means
    /// the routing was applied, `Ok(false)` that the platform cannot apply
    /// it and the toggle is cosmetic.
    fn set_loudspeaker(&self, on: bool) -> Result<bool, MediaError>;
}

/// cpal-backed probe over the default host's output devices.
#[derive(Debug, Default, Clone)]
pub struct DeviceOutputRoute;

impl DeviceOutputRoute {
    fn loudspeaker_device_name() -> Option<String> {
        let host = cpal::default_host();
        let devices = host.output_devices().ok()?;
        devices
            .filter_map(|device| device.name().ok())
            .find(|name| name.to_lowercase().contains("speaker"))
    }
}

impl OutputRoute for DeviceOutputRoute {
    fn supports_routing(&self) -> bool {
        // Desktop hosts cannot retarget an already-open stream, even when a
        // loudspeaker-class device exists.
        false
    }

    fn set_loudspeaker(&self, on: bool) -> Result<bool, MediaError> {
        match Self::loudspeaker_device_name() {
            Some(name) => tracing::debug!(
                ?name,
                ?on,
                "Loudspeaker present but rerouting an open stream is unsupported"
            ),
            None => tracing::debug!(?on, "No loudspeaker-class output device found"),
        }
        Ok(false)
    }
}

/// Route with a fixed capability, for tests and embedders that manage
/// output selection themselves.
#[derive(Debug, Clone)]
pub struct FixedOutputRoute {
    supported: bool,
}

impl FixedOutputRoute {
    pub fn new(supported: bool) -> Self {
        Self { supported }
    }
}

impl OutputRoute for FixedOutputRoute {
    fn supports_routing(&self) -> bool {
        self.supported
    }

    fn set_loudspeaker(&self, on: bool) -> Result<bool, MediaError> {
        tracing::debug!(?on, supported = ?self.supported, "Applying fixed output route");
        Ok(self.supported)
    }
}
