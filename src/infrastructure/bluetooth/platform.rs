//! btleplug-backed [`GattTransport`].
//!
//! btleplug negotiates the ATT MTU inside the platform stack and does not
//! expose the result, so `request_mtu` reports the configured assumption.
//! Link loss is detected by a watchdog polling `is_connected`; when it trips,
//! the notification stream ends.

use crate::domain::models::AppEvent;
use crate::infrastructure::bluetooth::scanner::{self, BleScanner};
use crate::infrastructure::bluetooth::transport::{
    DiscoveredCharacteristic, GattTransport, Notification, NotificationStream, TransportError,
};
use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::channel::mpsc;
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

pub struct BtleplugTransport {
    scanner: BleScanner,
    scan_timeout: Duration,
    assumed_mtu: u16,
    peripheral: Option<Peripheral>,
    forwarder: Option<JoinHandle<()>>,
}

impl BtleplugTransport {
    /// `event_sender` receives the device lookup's progress.
    pub async fn new(
        scan_timeout: Duration,
        assumed_mtu: u16,
        event_sender: Option<tokio::sync::mpsc::UnboundedSender<AppEvent>>,
    ) -> Result<Self, TransportError> {
        let adapter = scanner::default_adapter().await?;
        Ok(Self {
            scanner: BleScanner::new(adapter, event_sender),
            scan_timeout,
            assumed_mtu,
            peripheral: None,
            forwarder: None,
        })
    }

    fn peripheral(&self) -> Result<&Peripheral, TransportError> {
        self.peripheral.as_ref().ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral()?
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::UnknownCharacteristic(uuid))
    }

    fn stop_forwarder(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn connect(&mut self, device_id: &str) -> Result<(), TransportError> {
        let peripheral = self.scanner.find(device_id, self.scan_timeout).await?;
        peripheral.connect().await?;
        info!("Connected to {}", peripheral.address());
        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn request_mtu(&mut self, mtu: u16) -> Result<u16, TransportError> {
        self.peripheral()?;
        Ok(mtu.min(self.assumed_mtu))
    }

    async fn discover(&mut self) -> Result<Vec<DiscoveredCharacteristic>, TransportError> {
        let peripheral = self.peripheral()?;
        peripheral.discover_services().await?;
        Ok(peripheral
            .characteristics()
            .into_iter()
            .map(|c| DiscoveredCharacteristic {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
            })
            .collect())
    }

    async fn subscribe(&mut self, uuid: Uuid) -> Result<(), TransportError> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral()?.subscribe(&characteristic).await?;
        debug!("Subscribed to {}", uuid);
        Ok(())
    }

    async fn notifications(&mut self) -> Result<NotificationStream, TransportError> {
        self.stop_forwarder();
        let peripheral = self.peripheral()?.clone();
        let mut source = peripheral.notifications().await?;
        let (tx, rx) = mpsc::unbounded();

        self.forwarder = Some(tokio::spawn(async move {
            let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
            loop {
                tokio::select! {
                    notification = source.next() => match notification {
                        Some(n) => {
                            let forwarded = Notification { uuid: n.uuid, value: n.value };
                            if tx.unbounded_send(forwarded).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = watchdog.tick() => {
                        if !peripheral.is_connected().await.unwrap_or(false) {
                            warn!("Watchdog: peripheral disconnected unexpectedly");
                            break;
                        }
                    }
                }
            }
        }));

        Ok(rx.boxed())
    }

    async fn write(&mut self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral()?
            .write(&characteristic, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read(&mut self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(uuid)?;
        Ok(self.peripheral()?.read(&characteristic).await?)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_forwarder();
        if let Some(peripheral) = self.peripheral.take() {
            if peripheral.is_connected().await.unwrap_or(false) {
                peripheral.disconnect().await?;
            }
            info!("Disconnected from {}", peripheral.address());
        }
        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}
