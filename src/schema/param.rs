//! Leaf parameter modeling for the manifest schema.
//!
//! Every terminal node of the schema tree is a [`Parameter`]: a typed value
//! slot plus the metadata that makes the schema self-describing (default
//! value, CLI switch, lock bit, requirement class, help text, and provenance
//! fields for file/dir parameters).
//!
//! Values are stored in their string form ([`RawValue`]) and coerced into
//! [`TypedValue`] on read, so a manifest round-trips byte-for-byte through
//! JSON/YAML regardless of the declared type.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Scalar type tags supported by the schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Str,
    Num,
    Bool,
    File,
    Dir,
    /// A `(float,float)` coordinate pair, stored as `"(x,y)"`.
    FloatPair,
}

impl ScalarKind {
    /// True for kinds that carry file-provenance fields (hash, date, ...).
    #[must_use]
    pub fn is_path(self) -> bool {
        matches!(self, ScalarKind::File | ScalarKind::Dir)
    }

    fn as_str(self) -> &'static str {
        match self {
            ScalarKind::Str => "str",
            ScalarKind::Num => "num",
            ScalarKind::Bool => "bool",
            ScalarKind::File => "file",
            ScalarKind::Dir => "dir",
            ScalarKind::FloatPair => "(float,float)",
        }
    }
}

/// Full parameter type: a scalar kind, optionally wrapped in a list marker.
///
/// The wire encoding matches the schema text form: `str`, `[file]`,
/// `(float,float)`, `[(float,float)]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParamType {
    pub scalar: ScalarKind,
    pub list: bool,
}

impl ParamType {
    #[must_use]
    pub const fn scalar(kind: ScalarKind) -> Self {
        Self {
            scalar: kind,
            list: false,
        }
    }

    #[must_use]
    pub const fn list(kind: ScalarKind) -> Self {
        Self {
            scalar: kind,
            list: true,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.list {
            write!(f, "[{}]", self.scalar.as_str())
        } else {
            f.write_str(self.scalar.as_str())
        }
    }
}

/// Error parsing a type tag out of its text form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown parameter type tag: {0}")]
pub struct ParseTypeError(pub String);

impl FromStr for ParamType {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (inner, list) = match s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            Some(inner) => (inner, true),
            None => (s, false),
        };
        let scalar = match inner {
            "str" => ScalarKind::Str,
            "num" => ScalarKind::Num,
            "bool" => ScalarKind::Bool,
            "file" => ScalarKind::File,
            "dir" => ScalarKind::Dir,
            "(float,float)" => ScalarKind::FloatPair,
            other => return Err(ParseTypeError(other.to_string())),
        };
        Ok(ParamType { scalar, list })
    }
}

impl Serialize for ParamType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ParamType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Stored (uncoerced) parameter value.
///
/// Scalars are single strings; list parameters hold ordered string lists.
/// Absence (`Option::None` at the [`Parameter`] level) means unset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    List(Vec<String>),
    Scalar(String),
}

impl RawValue {
    /// Empty in the prune/requirement sense: an empty list. Unset values are
    /// represented by the absence of a `RawValue`, not by a variant here.
    #[must_use]
    pub fn is_empty_list(&self) -> bool {
        matches!(self, RawValue::List(items) if items.is_empty())
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Scalar(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Scalar(s)
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        RawValue::Scalar(if b { "true" } else { "false" }.to_string())
    }
}

impl From<f64> for RawValue {
    fn from(n: f64) -> Self {
        RawValue::Scalar(format_num(n))
    }
}

impl From<i64> for RawValue {
    fn from(n: i64) -> Self {
        RawValue::Scalar(n.to_string())
    }
}

impl From<(f64, f64)> for RawValue {
    fn from((a, b): (f64, f64)) -> Self {
        RawValue::Scalar(format!("({},{})", format_num(a), format_num(b)))
    }
}

impl From<Vec<String>> for RawValue {
    fn from(items: Vec<String>) -> Self {
        RawValue::List(items)
    }
}

impl From<Vec<&str>> for RawValue {
    fn from(items: Vec<&str>) -> Self {
        RawValue::List(items.into_iter().map(str::to_string).collect())
    }
}

/// Render a number without a trailing `.0` for integral values, so numeric
/// parameters read back the way users wrote them.
fn format_num(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Coerced parameter value returned by reads.
///
/// `Unset` is the sentinel for scalar parameters with no value and no
/// default; it is never silently coerced into a zero value.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedValue {
    Unset,
    Str(String),
    Num(f64),
    Bool(bool),
    FloatPair(f64, f64),
    List(Vec<TypedValue>),
}

impl TypedValue {
    #[must_use]
    pub fn is_unset(&self) -> bool {
        matches!(self, TypedValue::Unset)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_num(&self) -> Option<f64> {
        match self {
            TypedValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Collapse a list of string-kind items into owned strings.
    /// Non-list or non-string reads yield an empty vec.
    #[must_use]
    pub fn into_str_list(self) -> Vec<String> {
        match self {
            TypedValue::List(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    TypedValue::Str(s) => Some(s),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// True when the value is set and non-empty (non-empty list for lists).
    #[must_use]
    pub fn is_set(&self) -> bool {
        match self {
            TypedValue::Unset => false,
            TypedValue::List(items) => !items.is_empty(),
            _ => true,
        }
    }
}

/// A terminal schema node: typed value slot plus self-describing metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    #[serde(rename = "type")]
    pub ptype: ParamType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<RawValue>,
    pub defvalue: Option<RawValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<String>,
    #[serde(default)]
    pub lock: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub example: Vec<String>,
    // Provenance fields, only meaningful for file/dir parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub date: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub author: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<String>,
}

impl Parameter {
    /// A new parameter of the given type with everything unset.
    #[must_use]
    pub fn new(ptype: ParamType) -> Self {
        let defvalue = if ptype.list {
            Some(RawValue::List(Vec::new()))
        } else {
            None
        };
        Self {
            ptype,
            value: None,
            defvalue,
            switch: None,
            lock: false,
            requirement: None,
            short_help: None,
            help: None,
            example: Vec::new(),
            hash: Vec::new(),
            date: Vec::new(),
            author: Vec::new(),
            signature: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_defvalue(mut self, def: impl Into<RawValue>) -> Self {
        self.defvalue = Some(def.into());
        self
    }

    #[must_use]
    pub fn with_switch(mut self, switch: impl Into<String>) -> Self {
        self.switch = Some(switch.into());
        self
    }

    #[must_use]
    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirement = Some(requirement.into());
        self
    }

    #[must_use]
    pub fn with_short_help(mut self, short_help: impl Into<String>) -> Self {
        self.short_help = Some(short_help.into());
        self
    }

    #[must_use]
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// The value a read resolves to: `value` when present, else `defvalue`.
    #[must_use]
    pub fn effective(&self) -> Option<&RawValue> {
        self.value.as_ref().or(self.defvalue.as_ref())
    }

    /// True when both `value` and `defvalue` are in the empty set
    /// `{unset, []}` (just `{unset}` when `keep_lists`).
    #[must_use]
    pub fn is_empty(&self, keep_lists: bool) -> bool {
        let slot_empty = |slot: &Option<RawValue>| match slot {
            None => true,
            Some(raw) => !keep_lists && raw.is_empty_list(),
        };
        slot_empty(&self.value) && slot_empty(&self.defvalue)
    }

    /// Coerce the effective value through the declared type.
    ///
    /// List parameters always read as `TypedValue::List` (empty when unset);
    /// scalar parameters read as the coerced scalar or `Unset`. Stored items
    /// that fail coercion degrade to `Unset` rather than panicking — the
    /// accessor's typecheck keeps them out of the tree in the first place.
    #[must_use]
    pub fn read(&self) -> TypedValue {
        match self.effective() {
            None => {
                if self.ptype.list {
                    TypedValue::List(Vec::new())
                } else {
                    TypedValue::Unset
                }
            }
            Some(RawValue::List(items)) => TypedValue::List(
                items
                    .iter()
                    .map(|item| coerce_scalar(self.ptype.scalar, item))
                    .collect(),
            ),
            Some(RawValue::Scalar(item)) => {
                if self.ptype.list {
                    // A scalar stored in a list slot reads as a 1-list.
                    TypedValue::List(vec![coerce_scalar(self.ptype.scalar, item)])
                } else {
                    coerce_scalar(self.ptype.scalar, item)
                }
            }
        }
    }

    /// Check a candidate value against the declared type without mutating.
    ///
    /// Returns the human-readable reason on mismatch.
    pub fn typecheck(&self, candidate: &RawValue) -> Result<(), String> {
        match candidate {
            RawValue::List(items) => {
                if !self.ptype.list {
                    return Err("value must be scalar".to_string());
                }
                for item in items {
                    typecheck_scalar(self.ptype.scalar, item)?;
                }
                Ok(())
            }
            RawValue::Scalar(item) => typecheck_scalar(self.ptype.scalar, item),
        }
    }

    /// Normalize a candidate into storage shape for this parameter:
    /// scalars destined for list slots get wrapped into a 1-list.
    #[must_use]
    pub fn normalize(&self, candidate: RawValue) -> RawValue {
        match (self.ptype.list, candidate) {
            (true, RawValue::Scalar(s)) => RawValue::List(vec![s]),
            (_, other) => other,
        }
    }
}

fn coerce_scalar(kind: ScalarKind, item: &str) -> TypedValue {
    match kind {
        ScalarKind::Str | ScalarKind::File | ScalarKind::Dir => {
            TypedValue::Str(item.to_string())
        }
        ScalarKind::Num => item
            .parse::<f64>()
            .map(TypedValue::Num)
            .unwrap_or(TypedValue::Unset),
        ScalarKind::Bool => match item {
            "true" => TypedValue::Bool(true),
            "false" => TypedValue::Bool(false),
            _ => TypedValue::Unset,
        },
        ScalarKind::FloatPair => parse_pair(item)
            .map(|(a, b)| TypedValue::FloatPair(a, b))
            .unwrap_or(TypedValue::Unset),
    }
}

fn typecheck_scalar(kind: ScalarKind, item: &str) -> Result<(), String> {
    match kind {
        ScalarKind::Str | ScalarKind::File | ScalarKind::Dir => Ok(()),
        ScalarKind::Num => item
            .parse::<f64>()
            .map(|_| ())
            .map_err(|_| format!("cannot cast '{item}' to num")),
        ScalarKind::Bool => {
            if item == "true" || item == "false" {
                Ok(())
            } else {
                Err(format!("valid boolean values are 'true'/'false', got '{item}'"))
            }
        }
        ScalarKind::FloatPair => parse_pair(item)
            .map(|_| ())
            .ok_or_else(|| format!("cannot cast '{item}' to (float,float)")),
    }
}

/// Parse `"(x,y)"` (whitespace tolerated) into a float pair.
fn parse_pair(item: &str) -> Option<(f64, f64)> {
    let stripped: String = item
        .chars()
        .filter(|c| *c != '(' && *c != ')' && !c.is_whitespace())
        .collect();
    let mut parts = stripped.split(',');
    let a = parts.next()?.parse::<f64>().ok()?;
    let b = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((a, b))
}
