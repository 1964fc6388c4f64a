//! BLE Scanner Module
//!
//! Discovers AR glasses over btleplug.

use crate::domain::models::{AppEvent, MessageSeverity, ScannedDevice, StatusMessage};
use crate::infrastructure::bluetooth::transport::TransportError;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Get the first Bluetooth adapter of the host
pub async fn default_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::Ble("No Bluetooth adapter found".to_string()))
}

/// Whether an advertisement belongs to the device we are looking for.
///
/// `target` matches as a substring of the advertised name or as the full
/// address (case-insensitive), so both `AR_GLASS` and a MAC work.
pub fn matches_target(target: &str, name: &str, address: &str) -> bool {
    !target.is_empty() && (name.contains(target) || address.eq_ignore_ascii_case(target))
}

/// Publishes scan results as [`AppEvent`]s when a receiver is attached
#[derive(Debug, Clone, Default)]
pub struct ScanReporter {
    event_sender: Option<mpsc::UnboundedSender<AppEvent>>,
}

impl ScanReporter {
    pub fn new(event_sender: Option<mpsc::UnboundedSender<AppEvent>>) -> Self {
        Self { event_sender }
    }

    pub fn found(&self, device: &ScannedDevice) {
        debug!("Found {:?}", device);
        self.publish(AppEvent::DeviceFound(device.clone()));
    }

    pub fn log(&self, message: impl Into<String>) {
        self.publish(AppEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity: MessageSeverity::Info,
        }));
    }

    fn publish(&self, event: AppEvent) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(event);
        }
    }
}

/// BLE Scanner for discovering the glasses
pub struct BleScanner {
    adapter: Adapter,
    reporter: ScanReporter,
}

impl BleScanner {
    pub fn new(adapter: Adapter, event_sender: Option<mpsc::UnboundedSender<AppEvent>>) -> Self {
        Self {
            adapter,
            reporter: ScanReporter::new(event_sender),
        }
    }

    /// Scan for `duration` and report what was seen.
    ///
    /// # Arguments
    /// * `name_filter` - Advertised name fragment to keep (ignored when `show_all_devices`)
    /// * `show_all_devices` - Report every BLE device in range
    pub async fn scan(
        &self,
        duration: Duration,
        name_filter: &str,
        show_all_devices: bool,
    ) -> Result<Vec<ScannedDevice>, TransportError> {
        info!("Scanning for {:?} ({:?})", name_filter, duration);
        self.reporter.log(format!("Scanning for {}...", name_filter));

        self.adapter.start_scan(ScanFilter::default()).await?;
        let devices = stop_after(
            self.collect(duration, name_filter, show_all_devices),
            self.adapter.stop_scan(),
        )
        .await?;

        self.reporter
            .log(format!("Scan finished: {} device(s)", devices.len()));
        Ok(devices)
    }

    /// Scan until a peripheral matching `target` shows up or `timeout` elapses.
    pub async fn find(&self, target: &str, timeout: Duration) -> Result<Peripheral, TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        let found = stop_after(self.poll_for(target, timeout), self.adapter.stop_scan()).await?;
        found.ok_or_else(|| TransportError::DeviceNotFound(target.to_string()))
    }

    async fn collect(
        &self,
        duration: Duration,
        name_filter: &str,
        show_all_devices: bool,
    ) -> Result<Vec<ScannedDevice>, TransportError> {
        tokio::time::sleep(duration).await;

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let address = peripheral.address().to_string();

            if show_all_devices || name.contains(name_filter) {
                let device = ScannedDevice {
                    name,
                    address,
                    signal_strength: props.rssi,
                };
                self.reporter.found(&device);
                devices.push(device);
            }
        }
        Ok(devices)
    }

    async fn poll_for(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<Option<Peripheral>, TransportError> {
        let poll = Duration::from_millis(250);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(peripheral) = self.matching_peripheral(target).await? {
                return Ok(Some(peripheral));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn matching_peripheral(&self, target: &str) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            let name = peripheral
                .properties()
                .await?
                .and_then(|props| props.local_name)
                .unwrap_or_default();
            let address = peripheral.address().to_string();
            if matches_target(target, &name, &address) {
                info!("Found {} ({})", name, address);
                self.reporter.log(format!("Found {} ({})", name, address));
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

/// Run `body`, then `stop` whatever the outcome. An error from `body` wins.
async fn stop_after<T, E>(
    body: impl Future<Output = Result<T, TransportError>>,
    stop: impl Future<Output = Result<(), E>>,
) -> Result<T, TransportError>
where
    TransportError: From<E>,
{
    let result = body.await;
    let stopped = stop.await.map_err(TransportError::from);
    match (result, stopped) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(stop_error)) => {
            warn!("Stopping the scan failed: {}", stop_error);
            Err(e)
        }
    }
}
