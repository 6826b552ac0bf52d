//! Dynamic parameter values.
//!
//! Every technique parameter is stored as a [`ParamValue`]. The schema attached to a
//! technique decides which shapes and categories are legal for each name, so the same
//! value type can travel through validation, packing and the structured form.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// An enumerated value with both of its representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumValue {
    /// Enumeration type, e.g. `IRange`.
    pub type_name: &'static str,
    /// Symbolic name used in the structured form.
    pub name: &'static str,
    /// Numeric code used in the native form.
    pub code: i32,
}

/// A parameter value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ParamValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Enum(EnumValue),
    Text(String),
    List(Vec<ParamValue>),
    Record(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// Wraps an enumeration member.
    pub fn from_enum<E: NativeEnum>(value: E) -> Self {
        Self::Enum(EnumValue {
            type_name: E::TYPE_NAME,
            name: value.name(),
            code: value.code(),
        })
    }

    /// Name of the value category, as reported in type errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Integer",
            Self::Float(_) => "Float",
            Self::Enum(e) => e.type_name,
            Self::Text(_) => "String",
            Self::List(_) => "List",
            Self::Record(_) => "Record",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of ints and floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Field of a record value; `Null` for anything else.
    pub fn field(&self, name: &str) -> ParamValue {
        match self {
            Self::Record(fields) => fields.get(name).cloned().unwrap_or_default(),
            _ => Self::Null,
        }
    }

    /// Default conversion from the structured form.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map_or(Self::Null, Self::Float),
            },
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Record(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Default conversion to the structured form. Enumerations use their symbolic name.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Enum(e) => Value::String(e.name.to_string()),
            Self::Text(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Record(fields) => {
                let mut map = Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), v.to_json());
                }
                Value::Object(map)
            }
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enum(e) => f.write_str(e.name),
            Self::Text(s) => write!(f, "{s:?}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// An enumeration with a symbolic (structured) and a numeric (native) form.
///
/// Implemented through the `native_enum!` macro.
pub trait NativeEnum: Copy + Eq + Send + Sync + 'static {
    /// Type name reported by validation errors.
    const TYPE_NAME: &'static str;

    /// Every member in declaration order.
    fn all() -> &'static [Self];

    /// Native code.
    fn code(self) -> i32;

    /// Symbolic name.
    fn name(self) -> &'static str;

    fn from_code(code: i32) -> Option<Self> {
        Self::all().iter().copied().find(|v| v.code() == code)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|v| v.name() == name)
    }

    /// Extracts a member from a parameter value of this enumeration type.
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Enum(e) if e.type_name == Self::TYPE_NAME => Self::from_code(e.code),
            _ => None,
        }
    }
}

/// Structured-form converter for enumerated parameters: accepts the symbolic name.
pub fn parse_enum<E: NativeEnum>(value: &Value) -> Result<ParamValue, String> {
    match value {
        Value::String(name) => E::from_name(name)
            .map(ParamValue::from_enum)
            .ok_or_else(|| format!("'{name}' is not a valid {}", E::TYPE_NAME)),
        Value::Null => Ok(ParamValue::Null),
        other => Err(format!(
            "expected the name of a {} member, got {other}",
            E::TYPE_NAME
        )),
    }
}

/// Declares an enumeration implementing [`NativeEnum`] plus its serde and display impls.
macro_rules! native_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident as $type_name:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $crate::schema::NativeEnum for $name {
            const TYPE_NAME: &'static str = $type_name;

            fn all() -> &'static [Self] {
                &[$($name::$variant),+]
            }

            fn code(self) -> i32 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($crate::schema::NativeEnum::name(*self))
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str($crate::schema::NativeEnum::name(*self))
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let name = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                <Self as $crate::schema::NativeEnum>::from_name(&name).ok_or_else(|| {
                    <D::Error as ::serde::de::Error>::custom(format!(
                        "'{}' is not a valid {}",
                        name, $type_name
                    ))
                })
            }
        }

        impl From<$name> for $crate::schema::ParamValue {
            fn from(value: $name) -> Self {
                $crate::schema::ParamValue::from_enum(value)
            }
        }
    };
}

pub(crate) use native_enum;

/// Value category accepted by a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Integer or float.
    Number,
    Integer,
    Bool,
    /// Member of the named enumeration.
    Enum(&'static str),
}

impl ValueKind {
    pub fn accepts(self, value: &ParamValue) -> bool {
        match (self, value) {
            (Self::Number, ParamValue::Int(_) | ParamValue::Float(_)) => true,
            (Self::Integer, ParamValue::Int(_)) => true,
            (Self::Bool, ParamValue::Bool(_)) => true,
            (Self::Enum(expected), ParamValue::Enum(e)) => e.type_name == expected,
            _ => false,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Number => "Number",
            Self::Integer => "Integer",
            Self::Bool => "Bool",
            Self::Enum(name) => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    native_enum! {
        enum Colour as "Colour" {
            Red = -1 => "RED",
            Green = 4 => "GREEN",
        }
    }

    #[test]
    fn enum_codes_and_names() {
        assert_eq!(Colour::Red.code(), -1);
        assert_eq!(Colour::from_code(4), Some(Colour::Green));
        assert_eq!(Colour::from_name("RED"), Some(Colour::Red));
        assert_eq!(Colour::from_name("BLUE"), None);
        assert_eq!(serde_json::to_value(Colour::Green).unwrap(), json!("GREEN"));
        assert_eq!(
            Colour::from_param(&ParamValue::from(Colour::Green)),
            Some(Colour::Green)
        );
    }

    #[test]
    fn parse_enum_rejects_unknown_names() {
        assert_eq!(
            parse_enum::<Colour>(&json!("RED")).unwrap(),
            ParamValue::from(Colour::Red)
        );
        let err = parse_enum::<Colour>(&json!("BLUE")).unwrap_err();
        assert!(err.contains("Colour"));
    }

    #[test]
    fn json_numbers_keep_their_category() {
        assert_eq!(ParamValue::from_json(&json!(3)), ParamValue::Int(3));
        assert_eq!(ParamValue::from_json(&json!(3.5)), ParamValue::Float(3.5));
        assert_eq!(ParamValue::Float(2.0).to_json(), json!(2.0));
        let record = ParamValue::from_json(&json!({"voltage": 0.1, "vs_initial": false}));
        assert_eq!(record.field("voltage"), ParamValue::Float(0.1));
        assert_eq!(record.field("missing"), ParamValue::Null);
    }

    #[test]
    fn kinds_accept_their_category() {
        assert!(ValueKind::Number.accepts(&ParamValue::Int(1)));
        assert!(ValueKind::Number.accepts(&ParamValue::Float(1.0)));
        assert!(!ValueKind::Number.accepts(&ParamValue::Text("1".into())));
        assert!(!ValueKind::Integer.accepts(&ParamValue::Float(1.0)));
        assert!(ValueKind::Enum("Colour").accepts(&ParamValue::from(Colour::Red)));
        assert!(!ValueKind::Enum("Other").accepts(&ParamValue::from(Colour::Red)));
    }
}
