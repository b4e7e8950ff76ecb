//! SenML record labels and the two key schemes they travel in.
//!
//! V1 records use the short string keys from RFC 8428 (`n`, `v`, `bt`, ...).
//! V2 ("cloud protocol v2") records replace each string with a small integer.
//! The schemes are isomorphic, converting between them only rewrites map keys.

use ciborium::value::Value;

/// A recognised SenML field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    BaseVersion,
    BaseName,
    BaseTime,
    BaseUnit,
    BaseValue,
    BaseSum,
    Name,
    Unit,
    Value,
    StringValue,
    BoolValue,
    Sum,
    Time,
    UpdateTime,
    DataValue,
}

/// Which key scheme a record is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelScheme {
    /// String keys.
    #[default]
    V1,
    /// Integer keys.
    V2,
}

impl LabelScheme {
    pub fn from_flag(use_cloud_protocol_v2: bool) -> Self {
        if use_cloud_protocol_v2 {
            LabelScheme::V2
        } else {
            LabelScheme::V1
        }
    }
}

impl Label {
    pub const ALL: [Label; 15] = [
        Label::BaseVersion,
        Label::BaseName,
        Label::BaseTime,
        Label::BaseUnit,
        Label::BaseValue,
        Label::BaseSum,
        Label::Name,
        Label::Unit,
        Label::Value,
        Label::StringValue,
        Label::BoolValue,
        Label::Sum,
        Label::Time,
        Label::UpdateTime,
        Label::DataValue,
    ];

    /// The V1 string key.
    pub fn as_str(self) -> &'static str {
        match self {
            Label::BaseVersion => "bver",
            Label::BaseName => "bn",
            Label::BaseTime => "bt",
            Label::BaseUnit => "bu",
            Label::BaseValue => "bv",
            Label::BaseSum => "bs",
            Label::Name => "n",
            Label::Unit => "u",
            Label::Value => "v",
            Label::StringValue => "vs",
            Label::BoolValue => "vb",
            Label::Sum => "s",
            Label::Time => "t",
            Label::UpdateTime => "ut",
            Label::DataValue => "vd",
        }
    }

    /// The V2 integer key.
    pub fn code(self) -> i64 {
        match self {
            Label::BaseVersion => -1,
            Label::BaseName => -2,
            Label::BaseTime => -3,
            Label::BaseUnit => -4,
            Label::BaseValue => -5,
            Label::BaseSum => -6,
            Label::Name => 0,
            Label::Unit => 1,
            Label::Value => 2,
            Label::StringValue => 3,
            Label::BoolValue => 4,
            Label::Sum => 5,
            Label::Time => 6,
            Label::UpdateTime => 7,
            Label::DataValue => 8,
        }
    }

    pub fn from_str_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|label| label.as_str() == key)
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|label| label.code() == code)
    }

    /// Resolve a map key in either scheme: text keys are V1, integer keys are V2.
    pub fn from_key(key: &Value) -> Option<Self> {
        match key {
            Value::Text(s) => Self::from_str_key(s),
            Value::Integer(i) => i64::try_from(*i).ok().and_then(Self::from_code),
            _ => None,
        }
    }

    pub fn key(self, scheme: LabelScheme) -> Value {
        match scheme {
            LabelScheme::V1 => Value::Text(self.as_str().to_string()),
            LabelScheme::V2 => Value::Integer(self.code().into()),
        }
    }
}

fn remap(record: Value, scheme: LabelScheme) -> Value {
    match record {
        Value::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(key, value)| match Label::from_key(&key) {
                    Some(label) => (label.key(scheme), value),
                    None => (key, value),
                })
                .collect(),
        ),
        other => other,
    }
}

/// Rewrite the keys of a record map into the integer scheme.
///
/// Keys that are not SenML labels are carried over unchanged.
pub fn to_cloud_protocol_v2(record: Value) -> Value {
    remap(record, LabelScheme::V2)
}

/// Rewrite the keys of a record map into the string scheme.
pub fn to_cloud_protocol_v1(record: Value) -> Value {
    remap(record, LabelScheme::V1)
}
