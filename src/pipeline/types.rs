use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Discriminator used to resolve a stream on the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    #[default]
    Name,
    Type,
    Hostname,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Name => "name",
            StreamType::Type => "type",
            StreamType::Hostname => "hostname",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "name" => Ok(StreamType::Name),
            "type" => Ok(StreamType::Type),
            "hostname" => Ok(StreamType::Hostname),
            other => Err(Error::InvalidConfig(format!(
                "stream type must be one of name/type/hostname, got `{}`",
                other
            ))),
        }
    }
}

/// Sample value format declared by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelFormat {
    #[default]
    Float32,
    Double64,
    Int32,
    Int16,
    Int8,
    String,
}

/// Stream-level metadata reported by `connect()` / `stream_info()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub name: String,
    #[serde(rename = "type", default)]
    pub stream_type: String,
    #[serde(default)]
    pub hostname: String,
    pub channel_count: usize,
    #[serde(default)]
    pub channel_format: ChannelFormat,
    pub nominal_srate: f64,
    #[serde(default)]
    pub source_id: String,
    /// Transport specific extras (session id, version, manufacturer, ...)
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl StreamMetadata {
    pub fn new(name: impl Into<String>, channel_count: usize, nominal_srate: f64) -> Self {
        let name = name.into();
        Self {
            source_id: name.clone(),
            name,
            stream_type: String::new(),
            hostname: String::new(),
            channel_count,
            channel_format: ChannelFormat::default(),
            nominal_srate,
            extra: Map::new(),
        }
    }
}

/// Per-channel metadata entry of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChannelMetadata {
    pub label: String,
    #[serde(default)]
    pub unit: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl ChannelMetadata {
    pub fn new(label: impl Into<String>, unit: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            unit: unit.into(),
            kind: kind.into(),
        }
    }
}

/// Structured stream description: `{ meta_data, channels }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub meta_data: StreamMetadata,
    #[serde(default)]
    pub channels: Vec<ChannelMetadata>,
}

impl StreamInfo {
    pub fn new(meta_data: StreamMetadata, channels: Vec<ChannelMetadata>) -> Self {
        Self { meta_data, channels }
    }

    pub fn name(&self) -> &str {
        &self.meta_data.name
    }

    pub fn nominal_srate(&self) -> f64 {
        self.meta_data.nominal_srate
    }
}

/// One batch of `(timestamps, samples)` with samples shaped `[n_samples, n_channels]`
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub timestamps: Array1<f64>,
    pub samples: Array2<f64>,
}

impl Chunk {
    pub fn new(timestamps: Array1<f64>, samples: Array2<f64>) -> Result<Self> {
        if timestamps.len() != samples.nrows() {
            return Err(Error::Shape(format!(
                "{} timestamps for {} samples",
                timestamps.len(),
                samples.nrows()
            )));
        }
        Ok(Self { timestamps, samples })
    }

    /// Builds a chunk from row-major samples collected one at a time
    pub fn from_rows(timestamps: Vec<f64>, rows: Vec<Vec<f64>>, n_channels: usize) -> Result<Self> {
        let n_samples = rows.len();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let samples = Array2::from_shape_vec((n_samples, n_channels), flat)?;
        Self::new(Array1::from(timestamps), samples)
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len_of(Axis(0))
    }

    pub fn n_channels(&self) -> usize {
        self.samples.len_of(Axis(1))
    }

    pub fn into_parts(self) -> (Array1<f64>, Array2<f64>) {
        (self.timestamps, self.samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_stream_type_parse() {
        assert_eq!("hostname".parse::<StreamType>().unwrap(), StreamType::Hostname);
        assert!(matches!("mac".parse::<StreamType>(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_stream_info_json_shape() {
        let json = serde_json::json!({
            "meta_data": {
                "name": "Unicorn",
                "type": "EEG",
                "channel_count": 2,
                "channel_format": "float32",
                "nominal_srate": 250.0,
                "source_id": "UN-2021",
                "session_id": "default"
            },
            "channels": [
                {"label": "EEG 1", "unit": "muV", "type": "EEG"},
                {"label": "EEG 2", "unit": "muV", "type": "EEG"}
            ]
        });

        let info: StreamInfo = serde_json::from_value(json).unwrap();
        assert_eq!(info.name(), "Unicorn");
        assert_eq!(info.meta_data.stream_type, "EEG");
        assert_eq!(info.meta_data.extra["session_id"], "default");
        assert_eq!(info.channels.len(), info.meta_data.channel_count);
    }

    #[test]
    fn test_chunk_rejects_mismatched_timestamps() {
        let result = Chunk::new(array![0.0, 1.0], array![[1.0, 2.0]]);
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn test_chunk_from_rows() {
        let chunk = Chunk::from_rows(vec![0.0, 0.5], vec![vec![1.0, 2.0], vec![3.0, 4.0]], 2).unwrap();
        assert_eq!(chunk.n_samples(), 2);
        assert_eq!(chunk.n_channels(), 2);
        assert_eq!(chunk.samples, array![[1.0, 2.0], [3.0, 4.0]]);
    }
}
