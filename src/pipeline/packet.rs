//! Packets emitted by packet-oriented decoders.
//!
//! A decoder appends packets during its refresh; the list is cleared at the
//! start of the next refresh.

use crate::types::Color;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Start time in fs.
    pub offset: i64,
    /// Duration in fs.
    pub len: i64,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
    pub color: Color,
}

impl Packet {
    pub fn new(offset: i64, len: i64) -> Self {
        Self {
            offset,
            len,
            headers: BTreeMap::new(),
            data: Vec::new(),
            color: Color::DEFAULT,
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn end(&self) -> i64 {
        self.offset + self.len
    }
}
