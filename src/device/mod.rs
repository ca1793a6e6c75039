//! Paired-device and notification capabilities of the host.
//!
//! The host platform knows which devices are paired, whether the app may
//! use them, and which services they advertise. It also displays sign-in
//! notifications. Both are consumed through traits here; [`StaticCatalog`]
//! and [`LogNotifier`] are value-type implementations for the CLI and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::transport::{Endpoint, ServiceRecord};

/// A device paired with the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    /// Platform device id
    pub id: String,
    /// Display name
    pub name: String,
}

impl PairedDevice {
    /// Create a paired device entry
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Whether the user allowed this app to use a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    /// User allowed access
    Allowed,
    /// User denied access
    Denied,
    /// User has not decided
    #[default]
    Unspecified,
}

impl ConsentStatus {
    /// Only an explicit denial blocks the device.
    pub fn is_denied(self) -> bool {
        self == Self::Denied
    }
}

/// A resolved protocol service on a paired device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    /// Where to connect
    pub endpoint: Endpoint,
    /// Raw service record attributes
    pub record: ServiceRecord,
}

/// Paired-device queries.
#[async_trait]
pub trait DeviceCatalog: Send + Sync {
    /// Devices currently paired with the host.
    async fn paired_devices(&self) -> Result<Vec<PairedDevice>>;

    /// Consent for `device`.
    async fn check_consent(&self, device: &PairedDevice) -> Result<ConsentStatus>;

    /// Resolve `service_id` on `device`; `None` when not advertised.
    async fn resolve_service(
        &self,
        device: &PairedDevice,
        service_id: Uuid,
    ) -> Result<Option<RemoteService>>;
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    device: PairedDevice,
    consent: ConsentStatus,
    service: Option<RemoteService>,
}

/// Fixed list of paired devices.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, in enumeration order.
    pub fn with_device(
        mut self,
        device: PairedDevice,
        consent: ConsentStatus,
        service: Option<RemoteService>,
    ) -> Self {
        self.entries.push(CatalogEntry {
            device,
            consent,
            service,
        });
        self
    }

    fn entry(&self, device: &PairedDevice) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.device.id == device.id)
    }
}

#[async_trait]
impl DeviceCatalog for StaticCatalog {
    async fn paired_devices(&self) -> Result<Vec<PairedDevice>> {
        Ok(self.entries.iter().map(|e| e.device.clone()).collect())
    }

    async fn check_consent(&self, device: &PairedDevice) -> Result<ConsentStatus> {
        Ok(self.entry(device).map(|e| e.consent).unwrap_or_default())
    }

    async fn resolve_service(
        &self,
        device: &PairedDevice,
        service_id: Uuid,
    ) -> Result<Option<RemoteService>> {
        Ok(self
            .entry(device)
            .and_then(|e| e.service.clone())
            .filter(|s| s.endpoint.service_id == service_id))
    }
}

/// Sign-in notification shown by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMessage {
    /// Searching for the companion device
    LookingForDevice,
    /// Bluetooth is off
    BluetoothIsDisabled,
    /// The device wants attention
    DeviceNeedsAttention,
    /// The device must be registered again
    ReregisterRequired,
    /// Try the gesture again
    TryAgain,
    /// Sign-in may proceed
    ReadyToSignIn,
}

/// Displays sign-in notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Show `message` for the named device.
    async fn show(&self, device_name: &str, message: NotificationMessage) -> Result<()>;
}

/// Notifier that logs and remembers what it showed.
#[derive(Debug, Default)]
pub struct LogNotifier {
    shown: Mutex<Vec<(String, NotificationMessage)>>,
}

impl LogNotifier {
    /// Create an empty notifier
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications shown so far, oldest first
    pub async fn shown(&self) -> Vec<(String, NotificationMessage)> {
        self.shown.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn show(&self, device_name: &str, message: NotificationMessage) -> Result<()> {
        tracing::info!(device = %device_name, ?message, "Notification");
        self.shown.lock().await.push((device_name.to_string(), message));
        Ok(())
    }
}
