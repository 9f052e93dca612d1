//! Typed filter parameters with synchronous observers.

use super::error::{PipelineError, PipelineResult};
use crate::types::Unit;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A parameter value as stored in session documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ParameterValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Ints widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::String(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::String(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Int,
    Float,
    Bool,
    Enum,
    Filename,
    String,
}

pub type ParameterObserver = Box<dyn FnMut(&ParameterValue)>;

pub struct FilterParameter {
    kind: ParameterKind,
    value: ParameterValue,
    pub unit: Unit,
    enum_values: Vec<(String, i64)>,
    /// Glob mask shown by file pickers, e.g. `"*.vcd"`.
    pub file_mask: String,
    pub is_output_file: bool,
    observers: Vec<ParameterObserver>,
    change_count: u64,
}

impl FilterParameter {
    fn with(kind: ParameterKind, value: ParameterValue, unit: Unit) -> Self {
        Self {
            kind,
            value,
            unit,
            enum_values: Vec::new(),
            file_mask: String::new(),
            is_output_file: false,
            observers: Vec::new(),
            change_count: 0,
        }
    }

    pub fn int(value: i64, unit: Unit) -> Self {
        Self::with(ParameterKind::Int, ParameterValue::Int(value), unit)
    }

    pub fn float(value: f64, unit: Unit) -> Self {
        Self::with(ParameterKind::Float, ParameterValue::Float(value), unit)
    }

    pub fn bool(value: bool) -> Self {
        Self::with(ParameterKind::Bool, ParameterValue::Bool(value), Unit::Unitless)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::with(ParameterKind::String, ParameterValue::String(value.into()), Unit::Unitless)
    }

    /// Enumeration whose first entry is the default.
    pub fn enumeration(values: &[(&str, i64)]) -> Self {
        let default = values.first().map_or(0, |(_, v)| *v);
        let mut p = Self::with(ParameterKind::Enum, ParameterValue::Int(default), Unit::Unitless);
        p.enum_values = values.iter().map(|(n, v)| (n.to_string(), *v)).collect();
        p
    }

    pub fn filename(mask: &str, is_output: bool) -> Self {
        let mut p = Self::with(ParameterKind::Filename, ParameterValue::String(String::new()), Unit::Unitless);
        p.file_mask = mask.to_string();
        p.is_output_file = is_output;
        p
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    pub fn as_int(&self) -> i64 {
        match &self.value {
            ParameterValue::Int(v) => *v,
            ParameterValue::Float(v) => *v as i64,
            ParameterValue::Bool(v) => i64::from(*v),
            ParameterValue::String(_) => 0,
        }
    }

    pub fn as_float(&self) -> f64 {
        self.value.as_float().unwrap_or(0.0)
    }

    pub fn as_bool(&self) -> bool {
        self.value.as_bool().unwrap_or(false)
    }

    pub fn as_str(&self) -> &str {
        self.value.as_str().unwrap_or("")
    }

    pub fn enum_values(&self) -> &[(String, i64)] {
        &self.enum_values
    }

    /// Name of the selected enumeration entry.
    pub fn enum_name(&self) -> Option<&str> {
        let v = self.as_int();
        self.enum_values
            .iter()
            .find(|(_, ev)| *ev == v)
            .map(|(n, _)| n.as_str())
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&ParameterValue) + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Coerce `value` to this parameter's kind and store it, then notify
    /// observers in subscription order.
    pub fn set(&mut self, name: &str, value: ParameterValue) -> PipelineResult<()> {
        let mismatch = |expected: &str| PipelineError::ParameterType {
            name: name.to_string(),
            message: format!("expected {expected}, got {value:?}"),
        };
        let coerced = match (self.kind, &value) {
            (ParameterKind::Int, ParameterValue::Int(_)) => value.clone(),
            (ParameterKind::Int, ParameterValue::Float(f)) if f.fract() == 0.0 => ParameterValue::Int(*f as i64),
            (ParameterKind::Int, _) => return Err(mismatch("integer")),
            (ParameterKind::Float, v) => ParameterValue::Float(v.as_float().ok_or_else(|| mismatch("number"))?),
            (ParameterKind::Bool, ParameterValue::Bool(_)) => value.clone(),
            (ParameterKind::Bool, _) => return Err(mismatch("bool")),
            (ParameterKind::Enum, ParameterValue::Int(v)) => {
                if !self.enum_values.iter().any(|(_, ev)| ev == v) {
                    return Err(mismatch("enumeration value"));
                }
                value.clone()
            }
            (ParameterKind::Enum, ParameterValue::String(s)) => {
                let v = self
                    .enum_values
                    .iter()
                    .find(|(n, _)| n == s)
                    .map(|(_, v)| *v)
                    .ok_or_else(|| mismatch("enumeration name"))?;
                ParameterValue::Int(v)
            }
            (ParameterKind::Enum, _) => return Err(mismatch("enumeration")),
            (ParameterKind::Filename | ParameterKind::String, ParameterValue::String(_)) => value.clone(),
            (ParameterKind::Filename | ParameterKind::String, _) => return Err(mismatch("string")),
        };

        self.value = coerced;
        self.change_count += 1;
        for observer in &mut self.observers {
            observer(&self.value);
        }
        Ok(())
    }

    /// Value written to session documents. Enums are saved by name.
    pub fn to_json(&self) -> serde_json::Value {
        if self.kind == ParameterKind::Enum {
            if let Some(name) = self.enum_name() {
                return serde_json::Value::String(name.to_string());
            }
        }
        serde_json::to_value(&self.value).unwrap_or(serde_json::Value::Null)
    }

    pub fn load_json(&mut self, name: &str, json: &serde_json::Value) -> PipelineResult<()> {
        let value: ParameterValue =
            serde_json::from_value(json.clone()).map_err(|e| PipelineError::ParameterType {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        self.set(name, value)
    }
}

impl fmt::Debug for FilterParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterParameter")
            .field("kind", &self.kind)
            .field("value", &self.value)
            .field("unit", &self.unit)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Ordered name → parameter map.
#[derive(Debug, Default)]
pub struct ParameterSet {
    entries: Vec<(String, FilterParameter)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter, keeping first-insertion order.
    pub fn insert(&mut self, name: &str, param: FilterParameter) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, p)) => *p = param,
            None => self.entries.push((name.to_string(), param)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FilterParameter> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut FilterParameter> {
        self.entries.iter_mut().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn set(&mut self, name: &str, value: impl Into<ParameterValue>) -> PipelineResult<()> {
        self.get_mut(name)
            .ok_or_else(|| PipelineError::UnknownParameter(name.to_string()))?
            .set(name, value.into())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterParameter)> {
        self.entries.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of change counters, for "did anything change" checks.
    pub fn generation(&self) -> u64 {
        self.entries.iter().map(|(_, p)| p.change_count).sum()
    }

    pub fn int(&self, name: &str) -> i64 {
        self.get(name).map_or(0, |p| p.as_int())
    }

    pub fn float(&self, name: &str) -> f64 {
        self.get(name).map_or(0.0, |p| p.as_float())
    }

    pub fn bool(&self, name: &str) -> bool {
        self.get(name).is_some_and(|p| p.as_bool())
    }

    pub fn str(&self, name: &str) -> &str {
        self.get(name).map_or("", |p| p.as_str())
    }

    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.entries
            .iter()
            .map(|(n, p)| (n.clone(), p.to_json()))
            .collect()
    }
}
