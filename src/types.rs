//! Core value types for scopeflow
//!
//! This module contains the small value types shared by waveforms, streams,
//! filters and the session document.
//!
//! # Main Types
//!
//! - [`Unit`] - Physical unit of a stream axis (fs, Hz, V, %, ...)
//! - [`Color`] - RGB display colour, serialized as `#rrggbb`
//!
//! Units live on streams, not on waveforms: a waveform's timescale is a bare
//! integer that is interpreted through the owning stream's X unit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical unit of a stream axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    /// Time in femtoseconds (the native X unit)
    #[default]
    Femtoseconds,
    /// Frequency (spectra, Touchstone)
    Hertz,
    Volts,
    Amps,
    Watts,
    Ohms,
    /// Phase angle
    Degrees,
    /// Ratio stored as a fraction, displayed ×100
    Percent,
    Decibels,
    DecibelMilliwatts,
    /// Event or histogram counts
    Counts,
    /// Dimensionless value
    Unitless,
}

impl Unit {
    /// Short symbol used in CSV headers and logs
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Femtoseconds => "fs",
            Unit::Hertz => "Hz",
            Unit::Volts => "V",
            Unit::Amps => "A",
            Unit::Watts => "W",
            Unit::Ohms => "Ω",
            Unit::Degrees => "°",
            Unit::Percent => "%",
            Unit::Decibels => "dB",
            Unit::DecibelMilliwatts => "dBm",
            Unit::Counts => "counts",
            Unit::Unitless => "",
        }
    }

    /// Parse a unit from its symbol or its serialized name
    pub fn parse(s: &str) -> Option<Unit> {
        let unit = match s.trim() {
            "fs" | "femtoseconds" => Unit::Femtoseconds,
            "Hz" | "hertz" => Unit::Hertz,
            "V" | "volts" => Unit::Volts,
            "A" | "amps" => Unit::Amps,
            "W" | "watts" => Unit::Watts,
            "Ω" | "ohms" => Unit::Ohms,
            "°" | "deg" | "degrees" => Unit::Degrees,
            "%" | "percent" => Unit::Percent,
            "dB" | "decibels" => Unit::Decibels,
            "dBm" | "decibel_milliwatts" => Unit::DecibelMilliwatts,
            "counts" => Unit::Counts,
            "" | "unitless" => Unit::Unitless,
            _ => return None,
        };
        Some(unit)
    }

    /// Format a value in this unit with an SI prefix
    pub fn format_value(&self, value: f64) -> String {
        match self {
            Unit::Femtoseconds => format_si(value * 1e-15, "s"),
            Unit::Percent => format!("{:.2} %", value * 100.0),
            Unit::Degrees => format!("{:.2} °", value),
            Unit::Decibels | Unit::DecibelMilliwatts => format!("{:.2} {}", value, self.symbol()),
            Unit::Counts => format!("{}", value.round() as i64),
            Unit::Unitless => format!("{:.4}", value),
            _ => format_si(value, self.symbol()),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

fn format_si(value: f64, symbol: &str) -> String {
    const PREFIXES: [(f64, &str); 9] = [
        (1e12, "T"),
        (1e9, "G"),
        (1e6, "M"),
        (1e3, "k"),
        (1.0, ""),
        (1e-3, "m"),
        (1e-6, "µ"),
        (1e-9, "n"),
        (1e-12, "p"),
    ];
    if !value.is_finite() {
        return format!("{} {}", value, symbol);
    }
    let magnitude = value.abs();
    if magnitude == 0.0 {
        return format!("0 {}", symbol);
    }
    let (scale, prefix) = PREFIXES
        .iter()
        .copied()
        .find(|(scale, _)| magnitude >= *scale)
        .unwrap_or((1e-15, "f"));
    format!("{:.3} {}{}", value / scale, prefix, symbol)
}

/// RGB display colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Default trace colour for new channels
    pub const DEFAULT: Color = Color::rgb(0xff, 0xff, 0x80);

    // Protocol symbol palette
    pub const DATA: Color = Color::rgb(0x33, 0x66, 0xff);
    pub const CONTROL: Color = Color::rgb(0xc0, 0x80, 0xff);
    pub const ADDRESS: Color = Color::rgb(0xff, 0xff, 0x00);
    pub const PREAMBLE: Color = Color::rgb(0x80, 0x80, 0x80);
    pub const IDLE: Color = Color::rgb(0x60, 0x60, 0x60);
    pub const CHECKSUM_OK: Color = Color::rgb(0x00, 0xff, 0x00);
    pub const CHECKSUM_BAD: Color = Color::rgb(0xff, 0x00, 0x00);
    pub const ERROR: Color = Color::rgb(0xff, 0x00, 0x00);

    /// Parse `#rrggbb` (leading `#` optional)
    pub fn from_hex(s: &str) -> Option<Self> {
        let hex = s.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        Some(Self::rgb(channel(0)?, channel(2)?, channel(4)?))
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Color::from_hex(&s).ok_or_else(|| format!("invalid colour '{}'", s))
    }
}

impl From<Color> for String {
    fn from(c: Color) -> Self {
        c.to_hex()
    }
}
