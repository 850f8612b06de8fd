// params.rs — Typed scalar parameters for operations.
//
// Every operation declares the parameters it accepts as a list of
// `ParamSpec`s (name, kind, optional default). A pipeline step carries a
// `Params` map; the registry binds it against the declaration before shape
// inference runs, so kernels only ever see complete, well-typed maps.
//
// Binding rules:
//   - missing parameter with a default  → default is filled in
//   - missing parameter without default → InvalidParameter
//   - Int supplied where Float expected → widened to Float
//   - any other kind mismatch           → InvalidParameter
//   - parameter not declared at all     → InvalidParameter (typo guard)

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{PipelineError, Result};

/// One scalar parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Text(String),
    Floats(Vec<f64>),
    Dims(Vec<usize>),
}

/// The kind of a parameter, as declared by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Float,
    Int,
    Text,
    Floats,
    Dims,
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Text(_) => ParamKind::Text,
            ParamValue::Floats(_) => ParamKind::Floats,
            ParamValue::Dims(_) => ParamKind::Dims,
        }
    }

    /// Coerce to `kind`, if the value is compatible.
    fn coerce(self, kind: ParamKind) -> Option<ParamValue> {
        match (self, kind) {
            (ParamValue::Int(i), ParamKind::Float) => Some(ParamValue::Float(i as f64)),
            (v, k) if v.kind() == k => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamKind::Float => "float",
            ParamKind::Int => "int",
            ParamKind::Text => "text",
            ParamKind::Floats => "float list",
            ParamKind::Dims => "dimension list",
        };
        f.write_str(s)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v as f64)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(v: Vec<f64>) -> Self {
        ParamValue::Floats(v)
    }
}

impl<const N: usize> From<[f64; N]> for ParamValue {
    fn from(v: [f64; N]) -> Self {
        ParamValue::Floats(v.to_vec())
    }
}

impl From<Vec<usize>> for ParamValue {
    fn from(v: Vec<usize>) -> Self {
        ParamValue::Dims(v)
    }
}

impl<const N: usize> From<[usize; N]> for ParamValue {
    fn from(v: [usize; N]) -> Self {
        ParamValue::Dims(v.to_vec())
    }
}

/// Declaration of one parameter an operation accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<ParamValue>,
}

impl ParamSpec {
    /// A parameter the caller must always supply.
    pub fn required(name: &str, kind: ParamKind) -> Self {
        ParamSpec { name: name.to_string(), kind, default: None }
    }

    /// A parameter with a default value. The default's kind is the
    /// declared kind.
    pub fn optional(name: &str, default: impl Into<ParamValue>) -> Self {
        let default = default.into();
        ParamSpec { name: name.to_string(), kind: default.kind(), default: Some(default) }
    }
}

/// Named parameter values for one operation invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Self {
        Params::default()
    }

    /// Builder-style insert: `Params::new().with("value", 25.0)`.
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Check these parameters against an operation's declaration and
    /// return the complete, coerced set (defaults filled in).
    pub fn bind(&self, op: &str, specs: &[ParamSpec]) -> Result<Params> {
        if let Some((name, _)) = self.0.iter().find(|(k, _)| !specs.iter().any(|s| &s.name == *k)) {
            return Err(invalid(op, name, "not accepted by this operation"));
        }
        let mut bound = BTreeMap::new();
        for spec in specs {
            let value = match (self.0.get(&spec.name), &spec.default) {
                (Some(v), _) => v.clone(),
                (None, Some(d)) => d.clone(),
                (None, None) => return Err(invalid(op, &spec.name, "required parameter missing")),
            };
            let supplied = value.kind();
            let value = value.coerce(spec.kind).ok_or_else(|| {
                invalid(op, &spec.name, &format!("expected {}, got {supplied}", spec.kind))
            })?;
            bound.insert(spec.name.clone(), value);
        }
        Ok(Params(bound))
    }

    // --- Typed accessors (used by kernels on bound parameters) ---

    pub fn float(&self, name: &str) -> Result<f64> {
        match self.0.get(name) {
            Some(ParamValue::Float(v)) => Ok(*v),
            Some(ParamValue::Int(v)) => Ok(*v as f64),
            _ => Err(invalid("", name, "expected float")),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        match self.0.get(name) {
            Some(ParamValue::Int(v)) => Ok(*v),
            _ => Err(invalid("", name, "expected int")),
        }
    }

    pub fn text(&self, name: &str) -> Result<&str> {
        match self.0.get(name) {
            Some(ParamValue::Text(v)) => Ok(v),
            _ => Err(invalid("", name, "expected text")),
        }
    }

    pub fn floats(&self, name: &str) -> Result<&[f64]> {
        match self.0.get(name) {
            Some(ParamValue::Floats(v)) => Ok(v),
            _ => Err(invalid("", name, "expected float list")),
        }
    }

    pub fn dims(&self, name: &str) -> Result<&[usize]> {
        match self.0.get(name) {
            Some(ParamValue::Dims(v)) => Ok(v),
            _ => Err(invalid("", name, "expected dimension list")),
        }
    }
}

pub(crate) fn invalid(op: &str, name: &str, reason: &str) -> PipelineError {
    PipelineError::InvalidParameter {
        op: op.to_string(),
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
