//! Characteristic Registry
//!
//! Binds logical channels to the characteristics found by discovery. The
//! registry is rebuilt on every connection and cleared on disconnect.

use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::protocol::Channel;
use crate::infrastructure::bluetooth::transport::DiscoveredCharacteristic;
use anyhow::Context;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Expected UUID of every channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    uuids: HashMap<Channel, Uuid>,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            uuids: Channel::ALL
                .into_iter()
                .map(|channel| (channel, channel.default_uuid()))
                .collect(),
        }
    }
}

impl ChannelMap {
    pub fn from_settings(settings: &BleSettings) -> anyhow::Result<Self> {
        let entries = [
            (Channel::FileData, &settings.file_data_uuid),
            (Channel::FileControl, &settings.file_control_uuid),
            (Channel::FileName, &settings.file_name_uuid),
            (Channel::ImageLength, &settings.image_length_uuid),
            (Channel::ImageCommand, &settings.image_command_uuid),
            (Channel::ImageData, &settings.image_data_uuid),
            (Channel::Battery, &settings.battery_uuid),
            (Channel::CommandIn, &settings.command_in_uuid),
            (Channel::StatusNotify, &settings.status_notify_uuid),
        ];

        let mut uuids = HashMap::new();
        for (channel, text) in entries {
            let uuid = Uuid::parse_str(text)
                .with_context(|| format!("invalid UUID for the {} channel: {}", channel, text))?;
            uuids.insert(channel, uuid);
        }
        Ok(Self { uuids })
    }

    pub fn uuid(&self, channel: Channel) -> Uuid {
        self.uuids
            .get(&channel)
            .copied()
            .unwrap_or_else(|| channel.default_uuid())
    }
}

/// Resolved handle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
}

#[derive(Debug, Default)]
pub struct CharacteristicRegistry {
    handles: HashMap<Channel, ChannelHandle>,
}

impl CharacteristicRegistry {
    /// Bind every channel of `map` to a discovered characteristic.
    ///
    /// Fails with `ChannelMissing` for the first required channel the device
    /// does not expose; the registry is left empty in that case.
    pub fn populate(
        &mut self,
        map: &ChannelMap,
        discovered: &[DiscoveredCharacteristic],
    ) -> Result<(), LinkError> {
        self.handles.clear();

        let mut handles = HashMap::new();
        for channel in Channel::ALL {
            let uuid = map.uuid(channel);
            match discovered.iter().find(|c| c.uuid == uuid) {
                Some(found) => {
                    debug!("Bound {} to {}", channel, uuid);
                    handles.insert(
                        channel,
                        ChannelHandle {
                            uuid,
                            service_uuid: found.service_uuid,
                        },
                    );
                }
                None if channel.is_required() => return Err(LinkError::ChannelMissing(channel)),
                None => warn!("Optional {} channel not exposed by the device", channel),
            }
        }

        self.handles = handles;
        Ok(())
    }

    pub fn get(&self, channel: Channel) -> Option<&ChannelHandle> {
        self.handles.get(&channel)
    }

    /// Channel a notification belongs to
    pub fn channel_for(&self, uuid: Uuid) -> Option<Channel> {
        self.handles
            .iter()
            .find(|(_, handle)| handle.uuid == uuid)
            .map(|(channel, _)| *channel)
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
