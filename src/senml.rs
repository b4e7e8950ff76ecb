//! Property batches: SenML records serialized as a CBOR array.
//!
//! Outbound values are turned into one record (scalars) or one record per
//! attribute (objects, named `<property>:<attribute>`). Inbound frames are
//! decoded in either label scheme and regrouped into one [`PropertyEvent`]
//! per property.
//!
//! ```
//! use iotcloud::senml::{self, PropertyValue, Timestamp};
//!
//! let records = senml::encode("temp", &PropertyValue::from(22), Timestamp::At(1000), true, None).unwrap();
//! let bytes = senml::to_bytes(records).unwrap();
//!
//! let events = senml::group_by_property("/a/t/thing/e/i", &senml::decode(&bytes).unwrap());
//! assert_eq!(events.len(), 1);
//! assert_eq!(events[0].property_name.as_deref(), Some("temp"));
//! assert_eq!(events[0].value, PropertyValue::Number(22.0));
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use ciborium::value::Value;

use crate::error::{Error, Result};

mod label;

pub use label::{to_cloud_protocol_v1, to_cloud_protocol_v2, Label, LabelScheme};

/// A typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Number(f64),
    String(String),
    Bool(bool),
    /// Attributes in insertion order.
    Object(Vec<(String, PropertyValue)>),
}

impl PropertyValue {
    pub fn object<K: Into<String>>(attributes: impl IntoIterator<Item = (K, PropertyValue)>) -> Self {
        PropertyValue::Object(
            attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Look up an attribute of an object value.
    pub fn get(&self, attribute: &str) -> Option<&PropertyValue> {
        match self {
            PropertyValue::Object(attrs) => attrs
                .iter()
                .find(|(name, _)| name == attribute)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    fn set(&mut self, attribute: &str, value: PropertyValue) {
        if let PropertyValue::Object(attrs) = self {
            match attrs.iter_mut().find(|(name, _)| name == attribute) {
                Some((_, slot)) => *slot = value,
                None => attrs.push((attribute.to_string(), value)),
            }
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Number(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Number(v.into())
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Number(v as f64)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

/// Base time attached to the first record of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timestamp {
    /// Current wall-clock time, resolved at encode time.
    #[default]
    Now,
    /// Milliseconds since the Unix epoch.
    At(u64),
    /// Do not write a base time.
    Omit,
}

impl Timestamp {
    /// Interpret a raw millisecond value: `-1` omits the base time and `0` means now.
    ///
    /// ```
    /// use iotcloud::senml::Timestamp;
    ///
    /// assert_eq!(Timestamp::from_millis(-1).unwrap(), Timestamp::Omit);
    /// assert_eq!(Timestamp::from_millis(0).unwrap(), Timestamp::Now);
    /// assert_eq!(Timestamp::from_millis(1000).unwrap(), Timestamp::At(1000));
    /// assert!(Timestamp::from_millis(-2).is_err());
    /// ```
    pub fn from_millis(ms: i64) -> Result<Self> {
        match ms {
            -1 => Ok(Timestamp::Omit),
            0 => Ok(Timestamp::Now),
            ms if ms > 0 => Ok(Timestamp::At(ms as u64)),
            ms => Err(Error::invalid_argument(format!(
                "timestamp must be a non-negative integer or -1, got {}",
                ms
            ))),
        }
    }

    /// Like [`Timestamp::from_millis`] but rejects values with a fractional part.
    pub fn from_f64(ms: f64) -> Result<Self> {
        if !ms.is_finite() || ms.fract() != 0.0 || ms.abs() > i64::MAX as f64 {
            return Err(Error::invalid_argument(format!(
                "timestamp must be an integer, got {}",
                ms
            )));
        }
        Self::from_millis(ms as i64)
    }

    fn resolve(self) -> Option<i64> {
        match self {
            Timestamp::Now => Some(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or_default(),
            ),
            Timestamp::At(ms) => Some(ms as i64),
            Timestamp::Omit => None,
        }
    }
}

/// One decoded or to-be-encoded SenML record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub base_version: Option<i64>,
    pub base_name: Option<String>,
    pub base_time: Option<i64>,
    pub base_unit: Option<String>,
    pub base_value: Option<f64>,
    pub base_sum: Option<f64>,
    pub name: Option<String>,
    pub unit: Option<String>,
    pub value: Option<f64>,
    pub string_value: Option<String>,
    pub bool_value: Option<bool>,
    pub sum: Option<f64>,
    pub time: Option<f64>,
    pub update_time: Option<f64>,
    pub data_value: Option<String>,
}

impl Record {
    fn for_value(name: String, value: &PropertyValue) -> Self {
        let mut record = Record {
            name: Some(name),
            ..Default::default()
        };
        match value {
            PropertyValue::Number(n) => record.value = Some(*n),
            PropertyValue::String(s) => record.string_value = Some(s.clone()),
            PropertyValue::Bool(b) => record.bool_value = Some(*b),
            PropertyValue::Object(_) => {
                log::debug!(
                    "Nested object under {:?} cannot be encoded, writing record without value",
                    record.name
                );
            }
        }
        record
    }

    /// The record's value, numeric first, then string, then boolean.
    pub fn property_value(&self) -> Option<PropertyValue> {
        if let Some(v) = self.value {
            Some(PropertyValue::Number(v))
        } else if let Some(vs) = &self.string_value {
            Some(PropertyValue::String(vs.clone()))
        } else {
            self.bool_value.map(PropertyValue::Bool)
        }
    }

    /// Write the record as a CBOR map in the given label scheme.
    pub fn to_cbor(&self, scheme: LabelScheme) -> Value {
        let mut entries = Vec::new();
        let mut push = |label: Label, value: Option<Value>| {
            if let Some(value) = value {
                entries.push((label.key(scheme), value));
            }
        };

        push(Label::BaseTime, self.base_time.map(|t| Value::Integer(t.into())));
        push(Label::Name, self.name.clone().map(Value::Text));
        push(Label::BaseName, self.base_name.clone().map(Value::Text));
        push(Label::BaseVersion, self.base_version.map(|v| Value::Integer(v.into())));
        push(Label::BaseUnit, self.base_unit.clone().map(Value::Text));
        push(Label::BaseValue, self.base_value.map(number));
        push(Label::BaseSum, self.base_sum.map(number));
        push(Label::Unit, self.unit.clone().map(Value::Text));
        push(Label::Value, self.value.map(number));
        push(Label::StringValue, self.string_value.clone().map(Value::Text));
        push(Label::BoolValue, self.bool_value.map(Value::Bool));
        push(Label::Sum, self.sum.map(number));
        push(Label::Time, self.time.map(number));
        push(Label::UpdateTime, self.update_time.map(number));
        push(Label::DataValue, self.data_value.clone().map(Value::Text));

        Value::Map(entries)
    }

    /// Read a record map written in either label scheme.
    ///
    /// Unknown keys are skipped, as are known keys whose value has the wrong type.
    pub fn from_cbor(value: &Value) -> Result<Self> {
        let entries = match value {
            Value::Map(entries) => entries,
            other => {
                return Err(Error::Decode(format!(
                    "expected a record map, got {:?}",
                    other
                )))
            }
        };

        let mut record = Record::default();
        for (key, value) in entries {
            let Some(label) = Label::from_key(key) else {
                continue;
            };
            let accepted = match label {
                Label::BaseVersion => as_int(value).map(|v| record.base_version = Some(v)),
                Label::BaseName => as_text(value).map(|v| record.base_name = Some(v)),
                Label::BaseTime => as_number(value).map(|v| record.base_time = Some(v as i64)),
                Label::BaseUnit => as_text(value).map(|v| record.base_unit = Some(v)),
                Label::BaseValue => as_number(value).map(|v| record.base_value = Some(v)),
                Label::BaseSum => as_number(value).map(|v| record.base_sum = Some(v)),
                Label::Name => as_text(value).map(|v| record.name = Some(v)),
                Label::Unit => as_text(value).map(|v| record.unit = Some(v)),
                Label::Value => as_number(value).map(|v| record.value = Some(v)),
                Label::StringValue => as_text(value).map(|v| record.string_value = Some(v)),
                Label::BoolValue => match value {
                    Value::Bool(b) => Some(record.bool_value = Some(*b)),
                    _ => None,
                },
                Label::Sum => as_number(value).map(|v| record.sum = Some(v)),
                Label::Time => as_number(value).map(|v| record.time = Some(v)),
                Label::UpdateTime => as_number(value).map(|v| record.update_time = Some(v)),
                Label::DataValue => as_text(value).map(|v| record.data_value = Some(v)),
            };
            if accepted.is_none() {
                log::debug!("Ignoring {} with unexpected value {:?}", label.as_str(), value);
            }
        }
        Ok(record)
    }
}

fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Integer((n as i64).into())
    } else {
        Value::Float(n)
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(i128::from(*i) as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => i64::try_from(*i).ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        _ => None,
    }
}

/// Encode a property into SenML record maps.
///
/// Objects produce one record per attribute; only the first record carries
/// the base time and, when `device_id` is given, the base name
/// `urn:uuid:<device_id>`.
pub fn encode(
    name: &str,
    value: &PropertyValue,
    timestamp: Timestamp,
    use_cloud_protocol_v2: bool,
    device_id: Option<&str>,
) -> Result<Vec<Value>> {
    if name.is_empty() {
        return Err(Error::invalid_argument("property name must be a non-empty string"));
    }

    let base_time = timestamp.resolve();
    let base_name = device_id.map(|id| format!("urn:uuid:{}", id));

    let mut records = match value {
        PropertyValue::Object(attrs) => attrs
            .iter()
            .map(|(attr, v)| Record::for_value(format!("{}:{}", name, attr), v))
            .collect(),
        scalar => vec![Record::for_value(name.to_string(), scalar)],
    };
    if let Some(first) = records.first_mut() {
        first.base_time = base_time;
        first.base_name = base_name;
    }

    Ok(records
        .iter()
        .map(|record| {
            let record = record.to_cbor(LabelScheme::V1);
            if use_cloud_protocol_v2 {
                to_cloud_protocol_v2(record)
            } else {
                record
            }
        })
        .collect())
}

/// Serialize encoded records as one CBOR array.
pub fn to_bytes(records: Vec<Value>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&Value::Array(records), &mut buf)
        .map_err(|e| Error::Encode(e.to_string()))?;
    Ok(buf)
}

/// [`encode`] followed by [`to_bytes`].
pub fn encode_batch(
    name: &str,
    value: &PropertyValue,
    timestamp: Timestamp,
    use_cloud_protocol_v2: bool,
    device_id: Option<&str>,
) -> Result<Vec<u8>> {
    to_bytes(encode(
        name,
        value,
        timestamp,
        use_cloud_protocol_v2,
        device_id,
    )?)
}

/// Decode a CBOR frame into records, accepting either label scheme per record.
pub fn decode(bytes: &[u8]) -> Result<Vec<Record>> {
    let value: Value =
        ciborium::de::from_reader(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    match value {
        Value::Array(items) => items.iter().map(Record::from_cbor).collect(),
        map @ Value::Map(_) => Ok(vec![Record::from_cbor(&map)?]),
        other => Err(Error::Decode(format!(
            "expected an array of records, got {:?}",
            other
        ))),
    }
}

/// A property update decoded from one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEvent {
    pub topic: String,
    /// `None` for raw monitor payloads.
    pub property_name: Option<String>,
    pub value: PropertyValue,
}

struct Pending {
    name: String,
    value: Option<PropertyValue>,
}

impl Pending {
    fn absorb(&mut self, attribute: Option<&str>, value: Option<PropertyValue>) {
        match attribute {
            Some(attribute) => {
                if !matches!(self.value, Some(PropertyValue::Object(_))) {
                    self.value = Some(PropertyValue::Object(Vec::new()));
                }
                if let (Some(object), Some(value)) = (self.value.as_mut(), value) {
                    object.set(attribute, value);
                }
            }
            None => {
                if value.is_some() {
                    self.value = value;
                }
            }
        }
    }

    fn flush(self, topic: &str, events: &mut Vec<PropertyEvent>) {
        match self.value {
            Some(value) => events.push(PropertyEvent {
                topic: topic.to_string(),
                property_name: Some(self.name),
                value,
            }),
            None => log::debug!("Property {} carried no value", self.name),
        }
    }
}

/// Merge consecutive records into one event per property.
///
/// Record names are split at the first `:`. Consecutive records with the same
/// prefix build an object keyed by the suffix; a bare name yields a scalar.
pub fn group_by_property(topic: &str, records: &[Record]) -> Vec<PropertyEvent> {
    let mut events = Vec::new();
    let mut pending: Option<Pending> = None;

    for record in records {
        let full_name = record.name.as_deref().unwrap_or_default();
        let (property, attribute) = match full_name.split_once(':') {
            Some((property, attribute)) => (property, Some(attribute)),
            None => (full_name, None),
        };

        let current = match pending.take() {
            Some(p) if p.name == property => p,
            previous => {
                if let Some(previous) = previous {
                    previous.flush(topic, &mut events);
                }
                Pending {
                    name: property.to_string(),
                    value: None,
                }
            }
        };
        let current = pending.insert(current);
        current.absorb(attribute, record.property_value());
    }

    if let Some(last) = pending {
        last.flush(topic, &mut events);
    }
    events
}
