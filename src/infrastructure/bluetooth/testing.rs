//! In-memory stand-in for the glasses, used by the async tests.
//!
//! Mirrors the firmware: `takeimage` rewinds the camera buffer and answers
//! `image_ready`, each `getimage` pushes one chunk on image-data and the last
//! chunk is followed by `image_end`.

use crate::infrastructure::bluetooth::protocol::{
    Channel, BATTERY_UUID, DATA_SERVICE_UUID, IMAGE_COMMAND_UUID, IMAGE_DATA_UUID,
    IMAGE_LENGTH_UUID, STATUS_NOTIFY_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    DiscoveredCharacteristic, GattTransport, Notification, NotificationStream, TransportError,
};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FakeConfig {
    pub image: Vec<u8>,
    pub image_chunk: usize,
    /// Length reported instead of the image size
    pub declared_size: Option<u32>,
    pub ready_repeats: usize,
    pub send_image_end: bool,
    pub mtu: u16,
    pub reject_mtu: bool,
    pub missing: Vec<Uuid>,
    pub write_delay: Duration,
    /// Zero-based write attempts that fail
    pub fail_writes: Vec<usize>,
    pub stall_subscribe: bool,
    pub battery: Vec<u8>,
    /// Zero-based `getimage` requests whose chunk never arrives
    pub drop_chunks: Vec<usize>,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            image: Vec::new(),
            image_chunk: 400,
            declared_size: None,
            ready_repeats: 1,
            send_image_end: true,
            mtu: 512,
            reject_mtu: false,
            missing: Vec::new(),
            write_delay: Duration::ZERO,
            fail_writes: Vec::new(),
            stall_subscribe: false,
            battery: b"87".to_vec(),
            drop_chunks: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct FakeLog {
    writes: Vec<(Uuid, Vec<u8>)>,
    reads: Vec<Uuid>,
    write_attempts: usize,
    connects: usize,
    disconnects: usize,
}

type NotifySlot = Arc<Mutex<Option<mpsc::UnboundedSender<Notification>>>>;

pub struct FakeGlasses {
    config: FakeConfig,
    log: Arc<Mutex<FakeLog>>,
    notify: NotifySlot,
    image_cursor: usize,
    image_requests: usize,
}

/// Test-side view of a [`FakeGlasses`] after it moved into the link actor.
#[derive(Clone)]
pub struct FakeMonitor {
    log: Arc<Mutex<FakeLog>>,
    notify: NotifySlot,
}

impl FakeGlasses {
    pub fn new(config: FakeConfig) -> (Self, FakeMonitor) {
        let log = Arc::new(Mutex::new(FakeLog::default()));
        let notify: NotifySlot = Arc::new(Mutex::new(None));
        let monitor = FakeMonitor {
            log: log.clone(),
            notify: notify.clone(),
        };
        (
            Self {
                config,
                log,
                notify,
                image_cursor: 0,
                image_requests: 0,
            },
            monitor,
        )
    }

    fn push(&self, uuid: Uuid, value: &[u8]) {
        if let Some(tx) = self.notify.lock().unwrap().as_ref() {
            let _ = tx.unbounded_send(Notification {
                uuid,
                value: value.to_vec(),
            });
        }
    }

    fn on_image_command(&mut self, value: &[u8]) {
        match value {
            b"takeimage" => {
                self.image_cursor = 0;
                for _ in 0..self.config.ready_repeats {
                    self.push(STATUS_NOTIFY_UUID, b"image_ready");
                }
            }
            b"getimage" => {
                let request = self.image_requests;
                self.image_requests += 1;
                let image = &self.config.image;
                if self.image_cursor < image.len() {
                    let end = (self.image_cursor + self.config.image_chunk).min(image.len());
                    let chunk = image[self.image_cursor..end].to_vec();
                    self.image_cursor = end;
                    if self.config.drop_chunks.contains(&request) {
                        return;
                    }
                    self.push(IMAGE_DATA_UUID, &chunk);
                    if end == self.config.image.len() && self.config.send_image_end {
                        self.push(STATUS_NOTIFY_UUID, b"image_end");
                    }
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl GattTransport for FakeGlasses {
    async fn connect(&mut self, device_id: &str) -> Result<(), TransportError> {
        if device_id == "missing" {
            return Err(TransportError::DeviceNotFound(device_id.to_string()));
        }
        self.log.lock().unwrap().connects += 1;
        Ok(())
    }

    async fn request_mtu(&mut self, mtu: u16) -> Result<u16, TransportError> {
        if self.config.reject_mtu {
            return Err(TransportError::MtuRejected);
        }
        Ok(mtu.min(self.config.mtu))
    }

    async fn discover(&mut self) -> Result<Vec<DiscoveredCharacteristic>, TransportError> {
        Ok(Channel::ALL
            .into_iter()
            .map(|c| c.default_uuid())
            .filter(|uuid| !self.config.missing.contains(uuid))
            .map(|uuid| DiscoveredCharacteristic {
                uuid,
                service_uuid: DATA_SERVICE_UUID,
            })
            .collect())
    }

    async fn subscribe(&mut self, _uuid: Uuid) -> Result<(), TransportError> {
        if self.config.stall_subscribe {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn notifications(&mut self) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = mpsc::unbounded();
        *self.notify.lock().unwrap() = Some(tx);
        Ok(rx.boxed())
    }

    async fn write(&mut self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
        if !self.config.write_delay.is_zero() {
            tokio::time::sleep(self.config.write_delay).await;
        }
        {
            let mut log = self.log.lock().unwrap();
            let attempt = log.write_attempts;
            log.write_attempts += 1;
            if self.config.fail_writes.contains(&attempt) {
                return Err(TransportError::Ble(format!("write attempt {} refused", attempt)));
            }
            log.writes.push((uuid, value.to_vec()));
        }
        if uuid == IMAGE_COMMAND_UUID {
            self.on_image_command(value);
        }
        Ok(())
    }

    async fn read(&mut self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        self.log.lock().unwrap().reads.push(uuid);
        if uuid == IMAGE_LENGTH_UUID {
            let declared = self
                .config
                .declared_size
                .unwrap_or(self.config.image.len() as u32);
            return Ok(declared.to_le_bytes().to_vec());
        }
        if uuid == BATTERY_UUID {
            return Ok(self.config.battery.clone());
        }
        Err(TransportError::UnknownCharacteristic(uuid))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.notify.lock().unwrap().take();
        self.log.lock().unwrap().disconnects += 1;
        Ok(())
    }
}

impl FakeMonitor {
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.log.lock().unwrap().writes.clone()
    }

    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.writes()
            .into_iter()
            .filter(|(u, _)| *u == uuid)
            .map(|(_, value)| value)
            .collect()
    }

    pub fn count_writes(&self, uuid: Uuid, value: &[u8]) -> usize {
        self.writes_to(uuid).iter().filter(|v| v.as_slice() == value).count()
    }

    pub fn reads_of(&self, uuid: Uuid) -> usize {
        self.log
            .lock()
            .unwrap()
            .reads
            .iter()
            .filter(|u| **u == uuid)
            .count()
    }

    pub fn connects(&self) -> usize {
        self.log.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.log.lock().unwrap().disconnects
    }

    /// Push a status string as the firmware would.
    pub fn push_status(&self, status: &str) {
        if let Some(tx) = self.notify.lock().unwrap().as_ref() {
            let _ = tx.unbounded_send(Notification {
                uuid: STATUS_NOTIFY_UUID,
                value: status.as_bytes().to_vec(),
            });
        }
    }

    /// Simulate the glasses going out of range.
    pub fn drop_link(&self) {
        self.notify.lock().unwrap().take();
    }
}

/// JPEG-framed test image of `len` bytes.
pub fn jpeg_image(len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i % 200) as u8).collect();
    data[0] = 0xFF;
    data[1] = 0xD8;
    data[len - 2] = 0xFF;
    data[len - 1] = 0xD9;
    data
}
