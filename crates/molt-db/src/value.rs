//! Wire-agnostic value representation shared by query params and rows.

use serde::{Deserialize, Serialize};

/// The type tag a bound parameter must carry explicitly when its value is
/// null, and the type a statement cache key is built from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Bool,
    I64,
    F64,
    Text,
    Bytes,
}

/// A single scalar value, used both for bound parameters and decoded rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// A named, explicitly-typed bound parameter, as used internally by
/// [`crate::query::bind_params`] after a [`ParamsPayload`] has been
/// resolved to bind order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: ParamType,
    pub value: Value,
}

/// Whether a [`ParamsPayload`]'s `values` are bound by position (bind
/// order is the wire order, `name` must be absent) or by name (`name` is
/// required on every value; bind order is then sorted by name for
/// determinism).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamMode {
    Positional,
    Named,
}

impl Default for ParamMode {
    fn default() -> Self {
        Self::Positional
    }
}

/// One bound value as received over the wire — `name` is only meaningful
/// (and required) under [`ParamMode::Named`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub type_: ParamType,
    pub value: Value,
}

/// The wire shape of bound parameters: a mode tag plus the values in
/// wire order. Defaults to an empty positional list so requests that omit
/// `params` entirely still deserialize.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParamsPayload {
    #[serde(default)]
    pub mode: ParamMode,
    #[serde(default)]
    pub values: Vec<ParamInput>,
}

/// A decoded result set: column names plus rows of positional values.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

/// Canonicalizes params by sorting on `name` so parameter order never
/// affects the statement cache key or bind order. Rejects a `Null` value
/// with no explicit type tag — in
/// this representation that can't happen structurally (every `Param` has a
/// `type_`), so the check is really about callers constructing `Param`
/// from untyped JSON and skipping the type field; see `molt_db::query`.
pub fn canonicalize_params(mut params: Vec<Param>) -> Vec<Param> {
    params.sort_by(|a, b| a.name.cmp(&b.name));
    params
}
