use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hal::{ChannelKind, DeviceRegistry, SyncOptions};
use crate::session::{Sample, Setting, Subject, Timestamp};

/// Serialized channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub sampling_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChannelKind>,
}

/// Serialized device: the input of the device factory.
///
/// `class` names a registered device kind (optionally within `location`);
/// without `channels` the kind's default layout is used. The `update_*`
/// flags override the kind's sync defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<ChannelSpec>>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub load_data_kwargs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_device: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_channels: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_sampling_rate: Option<bool>,
}

impl DeviceSpec {
    pub fn of_class(class: impl Into<String>) -> Self {
        Self {
            class: Some(class.into()),
            ..Self::default()
        }
    }

    pub fn sync_options(&self, defaults: SyncOptions) -> SyncOptions {
        SyncOptions {
            update_device: self.update_device.unwrap_or(defaults.update_device),
            update_channels: self.update_channels.unwrap_or(defaults.update_channels),
            update_sampling_rate: self.update_sampling_rate.unwrap_or(defaults.update_sampling_rate),
        }
    }
}

fn default_setup_name() -> String {
    "setup".to_string()
}

/// Serialized setup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetupConfig {
    #[serde(default = "default_setup_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Session document describing a complete sample
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_version")]
    pub version: String,
    pub setup: SetupConfig,
    pub subject: Subject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting: Option<Setting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub comments: Vec<String>,
    #[serde(default)]
    pub filenames: Vec<PathBuf>,
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn build(&self, registry: &DeviceRegistry) -> Result<Sample> {
        Sample::from_config(self, registry)
    }
}
