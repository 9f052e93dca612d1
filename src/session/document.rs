//! On-disk session document.
//!
//! A session is a JSON tree listing the instruments that were connected and
//! every node of the filter graph. Nodes refer to each other through saved
//! integer IDs that are only meaningful inside one document.

use crate::error::{Result, ScopeError};
use crate::types::Color;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Current document format version.
pub const SESSION_VERSION: u32 = 1;

/// Instrument type bits for [`InstrumentSection::types`].
pub mod instrument_type {
    pub const OSCILLOSCOPE: u32 = 0x01;
    pub const MULTIMETER: u32 = 0x02;
    pub const POWER: u32 = 0x04;
    pub const FUNCTION_GENERATOR: u32 = 0x08;
    pub const RF_GENERATOR: u32 = 0x10;
    pub const LOAD: u32 = 0x20;
    pub const SPECTROMETER: u32 = 0x40;
}

/// Reference to a stream of another node in the same document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub id: u32,
    pub stream: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSection {
    /// Saved ID of the node carrying this channel's streams.
    pub id: u32,
    /// Hardware channel index.
    pub index: usize,
    #[serde(default = "default_color")]
    pub color: Color,
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub hwname: String,
    #[serde(default)]
    pub types: u32,
    #[serde(default)]
    pub inputs: Vec<Option<InputRef>>,
}

/// Saved output state of one power supply channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerChannelState {
    /// Voltage setpoint, V
    pub voltage: f64,
    /// Current limit, A
    pub current: f64,
    /// Shut down on overcurrent rather than limit.
    #[serde(default)]
    pub ocp_shutdown: bool,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerSupplyState {
    /// Absent for supplies without a master switch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_enable: Option<bool>,
    #[serde(default)]
    pub channels: Vec<PowerChannelState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSection {
    pub vendor: String,
    pub model: String,
    #[serde(default)]
    pub serial: String,
    pub nickname: String,
    pub driver: String,
    pub transport: String,
    #[serde(default)]
    pub args: String,
    /// Bitmask of [`instrument_type`] values.
    #[serde(default)]
    pub types: u32,
    #[serde(default)]
    pub channels: Vec<ChannelSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerSupplyState>,
}

impl InstrumentSection {
    pub fn has_type(&self, bit: u32) -> bool {
        self.types & bit != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSection {
    pub id: u32,
    pub protocol: String,
    #[serde(default)]
    pub nick: String,
    #[serde(default = "default_color")]
    pub color: Color,
    /// Everything the node's serializers wrote (`parameters`, `inputs`, ...).
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl FilterSection {
    /// Input bindings in slot order; `None` for unbound slots.
    ///
    /// Malformed entries read as unbound.
    pub fn inputs(&self) -> Vec<Option<InputRef>> {
        self.body
            .get("inputs")
            .and_then(Value::as_array)
            .map(|inputs| {
                inputs
                    .iter()
                    .map(|v| serde_json::from_value::<InputRef>(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn default_color() -> Color {
    Color::DEFAULT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub version: u32,
    #[serde(default)]
    pub instruments: Vec<InstrumentSection>,
    #[serde(default)]
    pub filters: Vec<FilterSection>,
}

impl Default for SessionDocument {
    fn default() -> Self {
        Self {
            version: SESSION_VERSION,
            instruments: Vec::new(),
            filters: Vec::new(),
        }
    }
}

impl SessionDocument {
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: Self = serde_json::from_str(text)?;
        if doc.version > SESSION_VERSION {
            return Err(ScopeError::Session(format!(
                "document version {} is newer than supported version {}",
                doc.version, SESSION_VERSION
            )));
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScopeError::Session(format!("Failed to read session file {:?}: {}", path, e)))?;
        Self::from_json(&content)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json()?)
            .map_err(|e| ScopeError::Session(format!("Failed to write session file {:?}: {}", path, e)))
    }

    pub fn filter(&self, id: u32) -> Option<&FilterSection> {
        self.filters.iter().find(|f| f.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "version": 1,
            "instruments": [{
                "vendor": "Rigol",
                "model": "DP832",
                "serial": "DP8A1234",
                "nickname": "psu",
                "driver": "rigol_dp8xx",
                "transport": "lan",
                "args": "10.0.0.5:5555",
                "types": instrument_type::POWER,
                "channels": [],
                "power": {
                    "master_enable": false,
                    "channels": [{ "voltage": 3.3, "current": 0.5, "ocp_shutdown": true, "enabled": true }]
                }
            }],
            "filters": [
                { "id": 1, "protocol": "Waveform Source", "nick": "scope", "color": "#ffff00",
                  "parameters": {}, "inputs": [], "streams": [] },
                { "id": 2, "protocol": "Subtract", "nick": "diff", "color": "#80ff80",
                  "parameters": {}, "inputs": [{ "id": 1, "stream": 0 }, null] }
            ]
        })
    }

    #[test]
    fn test_parse_document() {
        let doc = SessionDocument::from_json(&sample().to_string()).unwrap();
        assert_eq!(doc.instruments.len(), 1);
        assert!(doc.instruments[0].has_type(instrument_type::POWER));
        assert!(!doc.instruments[0].has_type(instrument_type::OSCILLOSCOPE));
        let power = doc.instruments[0].power.as_ref().unwrap();
        assert_eq!(power.master_enable, Some(false));
        assert_eq!(power.channels[0].voltage, 3.3);

        let diff = doc.filter(2).unwrap();
        assert_eq!(diff.nick, "diff");
        assert_eq!(diff.inputs(), vec![Some(InputRef { id: 1, stream: 0 }), None]);
        assert!(doc.filter(1).unwrap().body.contains_key("streams"));
    }

    #[test]
    fn test_flattened_body_survives_round_trip() {
        let doc = SessionDocument::from_json(&sample().to_string()).unwrap();
        let again = SessionDocument::from_json(&doc.to_json().unwrap()).unwrap();
        assert_eq!(doc, again);
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut v = sample();
        v["version"] = json!(SESSION_VERSION + 1);
        let err = SessionDocument::from_json(&v.to_string()).unwrap_err();
        assert!(err.to_string().contains("newer"));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bench.scopesession");
        let doc = SessionDocument::from_json(&sample().to_string()).unwrap();
        doc.save(&path).unwrap();
        assert_eq!(SessionDocument::load(&path).unwrap(), doc);
    }
}
