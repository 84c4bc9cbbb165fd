//! Conversion between wire JSON values and typed property values.
//!
//! Geometric values travel as an explicit tag:
//! ```text
//! {"$type": "vector3", "value": [1.0, 2.0, 3.0]}
//! ```
//! Legacy peers send bare numeric arrays instead. Under
//! [`ValueCoercion::Heuristic`] an all-numeric array of length 2, 3 or 4 is
//! read as a 2D vector, 3D vector or quaternion. The heuristic is a guess: a
//! four-element array may just as well be a color or a plain list, and a
//! property that really holds a short numeric list is misread. Use
//! [`ValueCoercion::TaggedOnly`] when every peer sends tagged values.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

/// Key holding the type tag of a geometric value.
pub const TYPE_TAG: &str = "$type";
/// Key holding the components of a geometric value.
pub const VALUE_KEY: &str = "value";

/// How untagged numeric arrays are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValueCoercion {
    /// Coerce all-numeric arrays of length 2/3/4 into geometric types.
    #[default]
    Heuristic,
    /// Only explicitly tagged values become geometric types.
    TaggedOnly,
}

/// Property value as handed to the tree accessor.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Vector2([f64; 2]),
    Vector3([f64; 3]),
    Quaternion([f64; 4]),
    Color([f64; 4]),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Convert a wire value.
    pub fn from_json(value: &Value, coercion: ValueCoercion) -> Self {
        match value {
            Value::Null => PropertyValue::Nil,
            Value::Bool(b) => PropertyValue::Bool(*b),
            Value::Number(n) => number_to_value(n),
            Value::String(s) => PropertyValue::String(s.clone()),
            Value::Array(items) => {
                if coercion == ValueCoercion::Heuristic {
                    if let Some(geometric) = coerce_numeric_array(items) {
                        return geometric;
                    }
                }
                PropertyValue::List(items.iter().map(|v| Self::from_json(v, coercion)).collect())
            }
            Value::Object(map) => {
                if let Some(tagged) = decode_tagged(map) {
                    return tagged;
                }
                PropertyValue::Map(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Self::from_json(v, coercion)))
                        .collect(),
                )
            }
        }
    }

    /// Convert to the wire representation. Geometric types are always tagged.
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Nil => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(i) => Value::from(*i),
            PropertyValue::Float(f) => float_to_json(*f),
            PropertyValue::String(s) => Value::String(s.clone()),
            PropertyValue::Vector2(c) => tagged("vector2", c),
            PropertyValue::Vector3(c) => tagged("vector3", c),
            PropertyValue::Quaternion(c) => tagged("quaternion", c),
            PropertyValue::Color(c) => tagged("color", c),
            PropertyValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            PropertyValue::Map(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            PropertyValue::Nil => "nil",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::String(_) => "string",
            PropertyValue::Vector2(_) => "vector2",
            PropertyValue::Vector3(_) => "vector3",
            PropertyValue::Quaternion(_) => "quaternion",
            PropertyValue::Color(_) => "color",
            PropertyValue::List(_) => "list",
            PropertyValue::Map(_) => "map",
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

fn number_to_value(n: &Number) -> PropertyValue {
    if let Some(i) = n.as_i64() {
        PropertyValue::Int(i)
    } else {
        // u64 beyond i64::MAX and all fractional numbers land here.
        PropertyValue::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn float_to_json(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn numeric_components(items: &[Value]) -> Option<Vec<f64>> {
    items.iter().map(Value::as_f64).collect()
}

fn coerce_numeric_array(items: &[Value]) -> Option<PropertyValue> {
    let c = numeric_components(items)?;
    match c.len() {
        2 => Some(PropertyValue::Vector2([c[0], c[1]])),
        3 => Some(PropertyValue::Vector3([c[0], c[1], c[2]])),
        4 => Some(PropertyValue::Quaternion([c[0], c[1], c[2], c[3]])),
        _ => None,
    }
}

fn decode_tagged(map: &Map<String, Value>) -> Option<PropertyValue> {
    if map.len() != 2 {
        return None;
    }
    let tag = map.get(TYPE_TAG)?.as_str()?;
    let c = numeric_components(map.get(VALUE_KEY)?.as_array()?)?;
    match (tag, c.len()) {
        ("vector2", 2) => Some(PropertyValue::Vector2([c[0], c[1]])),
        ("vector3", 3) => Some(PropertyValue::Vector3([c[0], c[1], c[2]])),
        ("quaternion", 4) => Some(PropertyValue::Quaternion([c[0], c[1], c[2], c[3]])),
        ("color", 4) => Some(PropertyValue::Color([c[0], c[1], c[2], c[3]])),
        _ => None,
    }
}

fn tagged(tag: &str, components: &[f64]) -> Value {
    let mut map = Map::new();
    map.insert(TYPE_TAG.to_string(), Value::String(tag.to_string()));
    map.insert(
        VALUE_KEY.to_string(),
        Value::Array(components.iter().map(|f| float_to_json(*f)).collect()),
    );
    Value::Object(map)
}
