//! Algo parameter schema and typed parameter values.
//!
//! An algo declares its configuration as [`ParamDefs`]; callers hand over a
//! [`ParamMap`] at spawn/modify time which is validated against that schema
//! before the algo ever sees it.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::domain::errors::ParamError;
use crate::domain::types::{DataSrc, OrderSide, SecurityId, SubAccountId};

/// A (security, account, side, quantity) reference used as a parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityTuple {
    pub src: DataSrc,
    pub sec: SecurityId,
    pub acc: SubAccountId,
    pub side: OrderSide,
    pub qty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamScalar {
    String(String),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Security(SecurityTuple),
}

impl ParamScalar {
    pub fn kind(&self) -> &'static str {
        match self {
            ParamScalar::String(_) => "string",
            ParamScalar::Bool(_) => "bool",
            ParamScalar::Int32(_) => "int32",
            ParamScalar::Int64(_) => "int64",
            ParamScalar::Double(_) => "double",
            ParamScalar::Security(_) => "security",
        }
    }

    /// Numeric view used for bound checks. Security tuples expose their quantity.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamScalar::Int32(v) => Some(*v as f64),
            ParamScalar::Int64(v) => Some(*v as f64),
            ParamScalar::Double(v) => Some(*v),
            ParamScalar::Security(t) => Some(t.qty),
            ParamScalar::String(_) | ParamScalar::Bool(_) => None,
        }
    }

    /// Whether a value of this kind may stand in for `expected`.
    /// Integers are accepted where a wider integer or a double is declared.
    fn accepts(expected: &ParamScalar, actual: &ParamScalar) -> bool {
        match (expected, actual) {
            (ParamScalar::String(_), ParamScalar::String(_))
            | (ParamScalar::Bool(_), ParamScalar::Bool(_))
            | (ParamScalar::Int32(_), ParamScalar::Int32(_))
            | (ParamScalar::Int64(_), ParamScalar::Int32(_) | ParamScalar::Int64(_))
            | (
                ParamScalar::Double(_),
                ParamScalar::Int32(_) | ParamScalar::Int64(_) | ParamScalar::Double(_),
            )
            | (ParamScalar::Security(_), ParamScalar::Security(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Scalar(ParamScalar),
    List(Vec<ParamScalar>),
}

impl ParamValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ParamValue::Scalar(s) => s.kind(),
            ParamValue::List(_) => "list",
        }
    }

    pub fn as_scalar(&self) -> Option<&ParamScalar> {
        match self {
            ParamValue::Scalar(s) => Some(s),
            ParamValue::List(_) => None,
        }
    }
}

impl From<ParamScalar> for ParamValue {
    fn from(value: ParamScalar) -> Self {
        ParamValue::Scalar(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Scalar(ParamScalar::String(value.to_string()))
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Scalar(ParamScalar::String(value))
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Scalar(ParamScalar::Bool(value))
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Scalar(ParamScalar::Int32(value))
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Scalar(ParamScalar::Int64(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Scalar(ParamScalar::Double(value))
    }
}

impl From<SecurityTuple> for ParamValue {
    fn from(value: SecurityTuple) -> Self {
        ParamValue::Scalar(ParamScalar::Security(value))
    }
}

impl From<Vec<ParamScalar>> for ParamValue {
    fn from(value: Vec<ParamScalar>) -> Self {
        ParamValue::List(value)
    }
}

/// One named, typed, bounded configuration field.
///
/// The default value fixes the field's type. `min_value`/`max_value` bound
/// numeric values (and security tuple quantities) only when `max_value > min_value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    pub default_value: ParamValue,
    pub required: bool,
    pub min_value: f64,
    pub max_value: f64,
    pub precision: u32,
}

impl ParamDef {
    pub fn new(name: impl Into<String>, default_value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            default_value: default_value.into(),
            required: false,
            min_value: 0.0,
            max_value: 0.0,
            precision: 0,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn bounds(mut self, min_value: f64, max_value: f64) -> Self {
        self.min_value = min_value;
        self.max_value = max_value;
        self
    }

    pub fn precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    fn is_bounded(&self) -> bool {
        self.max_value > self.min_value
    }

    fn check(&self, value: &ParamValue) -> Result<(), ParamError> {
        match (&self.default_value, value) {
            (ParamValue::Scalar(expected), ParamValue::Scalar(actual)) => {
                self.check_scalar(expected, actual)
            }
            (ParamValue::List(expected), ParamValue::List(actual)) => {
                // An empty default list leaves the element type open
                match expected.first() {
                    Some(first) => actual
                        .iter()
                        .try_for_each(|item| self.check_scalar(first, item)),
                    None => actual
                        .iter()
                        .try_for_each(|item| self.check_bounds(item)),
                }
            }
            (expected, actual) => Err(ParamError::TypeMismatch {
                name: self.name.clone(),
                expected: expected.kind(),
                actual: actual.kind(),
            }),
        }
    }

    fn check_scalar(&self, expected: &ParamScalar, actual: &ParamScalar) -> Result<(), ParamError> {
        if !ParamScalar::accepts(expected, actual) {
            return Err(ParamError::TypeMismatch {
                name: self.name.clone(),
                expected: expected.kind(),
                actual: actual.kind(),
            });
        }
        self.check_bounds(actual)
    }

    fn check_bounds(&self, value: &ParamScalar) -> Result<(), ParamError> {
        if let ParamScalar::Security(tuple) = value {
            if tuple.qty < 0.0 || tuple.qty.is_nan() {
                return Err(ParamError::InvalidSecurityTuple {
                    name: self.name.clone(),
                    reason: format!("quantity {} is negative", tuple.qty),
                });
            }
        }
        if !self.is_bounded() {
            return Ok(());
        }
        match value.as_f64() {
            Some(v) if v < self.min_value || v > self.max_value || v.is_nan() => {
                Err(ParamError::OutOfRange {
                    name: self.name.clone(),
                    value: v,
                    min: self.min_value,
                    max: self.max_value,
                })
            }
            _ => Ok(()),
        }
    }
}

/// The configuration schema of one algo implementation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamDefs(Vec<ParamDef>);

impl ParamDefs {
    pub fn new(defs: Vec<ParamDef>) -> Self {
        Self(defs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamDef> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&ParamDef> {
        self.0.iter().find(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Full validation used at spawn: schema sanity, required fields present,
    /// no unknown names, types and bounds respected.
    pub fn validate(&self, params: &ParamMap) -> Result<(), ParamError> {
        self.check_unique()?;
        for def in &self.0 {
            if def.required && !params.contains(&def.name) {
                return Err(ParamError::MissingRequired {
                    name: def.name.clone(),
                });
            }
        }
        self.validate_update(params)
    }

    /// Validation used for partial updates: only the supplied fields are checked.
    pub fn validate_update(&self, params: &ParamMap) -> Result<(), ParamError> {
        for (name, value) in params.iter() {
            let def = self.get(name).ok_or_else(|| ParamError::UnknownParam {
                name: name.clone(),
            })?;
            def.check(value)?;
        }
        Ok(())
    }

    /// Validates `params` and fills every absent optional field with its default.
    pub fn resolve(&self, mut params: ParamMap) -> Result<ParamMap, ParamError> {
        self.validate(&params)?;
        for def in &self.0 {
            if !params.contains(&def.name) {
                params.insert(def.name.clone(), def.default_value.clone());
            }
        }
        Ok(params)
    }

    fn check_unique(&self) -> Result<(), ParamError> {
        let mut seen = HashSet::new();
        for def in &self.0 {
            if !seen.insert(def.name.as_str()) {
                return Err(ParamError::DuplicateDefinition {
                    name: def.name.clone(),
                });
            }
        }
        Ok(())
    }
}

impl From<Vec<ParamDef>> for ParamDefs {
    fn from(defs: Vec<ParamDef>) -> Self {
        Self(defs)
    }
}

/// Resolved runtime values for one algo instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamMap(HashMap<String, ParamValue>);

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrites entries with those of `other`.
    pub fn merge(&mut self, other: ParamMap) {
        self.0.extend(other.0);
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name)?.as_scalar()? {
            ParamScalar::Security(_) => None,
            scalar => scalar.as_f64(),
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name)?.as_scalar()? {
            ParamScalar::Int32(v) => Some(*v as i64),
            ParamScalar::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)?.as_scalar()? {
            ParamScalar::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)?.as_scalar()? {
            ParamScalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn get_security(&self, name: &str) -> Option<&SecurityTuple> {
        match self.get(name)?.as_scalar()? {
            ParamScalar::Security(t) => Some(t),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&[ParamScalar]> {
        match self.get(name)? {
            ParamValue::List(items) => Some(items.as_slice()),
            ParamValue::Scalar(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String, ParamError> {
        serde_json::to_string(self).map_err(|e| ParamError::Malformed {
            reason: e.to_string(),
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, ParamError> {
        serde_json::from_str(raw).map_err(|e| ParamError::Malformed {
            reason: e.to_string(),
        })
    }
}
