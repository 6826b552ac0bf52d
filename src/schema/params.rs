//! Parameter descriptors, schemas and configured parameter sets.
//!
//! A [`ParamSchema`] is an ordered registry of [`Parameter`] descriptors. Technique
//! schemas overlay the common base schema, replacing entries that share a name and
//! appending the rest, so every name appears exactly once.
//!
//! A [`TechniqueParams`] holds the concrete values of one configured technique. Only
//! stored parameters keep a value; derived parameters are recomputed from the stored
//! ones on every access and constants are fixed by the descriptor.

use super::value::{parse_enum, NativeEnum, ParamValue, ValueKind};
use super::DataRange;
use crate::device::DeviceInfo;
use crate::error::{DaqError, DaqResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// One named parameter problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    /// Parameter name, with `[idx]` for array elements.
    pub param: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parameter '{}' {}", self.param, self.message)
    }
}

/// Native representation of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackType {
    Int,
    Bool,
    Single,
}

impl PackType {
    /// Converts a value to this native type. Enumerations pack as their code.
    fn pack(self, value: &ParamValue) -> Option<NativeValue> {
        match (self, value) {
            (Self::Int, ParamValue::Int(i)) => i32::try_from(*i).ok().map(NativeValue::Int),
            (Self::Int, ParamValue::Bool(b)) => Some(NativeValue::Int(i32::from(*b))),
            (Self::Int, ParamValue::Enum(e)) => Some(NativeValue::Int(e.code)),
            (Self::Bool, ParamValue::Bool(b)) => Some(NativeValue::Bool(*b)),
            (Self::Bool, ParamValue::Int(i)) => Some(NativeValue::Bool(*i != 0)),
            (Self::Bool, ParamValue::Enum(e)) => Some(NativeValue::Bool(e.code != 0)),
            (Self::Single, ParamValue::Float(f)) => Some(NativeValue::Single(*f as f32)),
            (Self::Single, ParamValue::Int(i)) => Some(NativeValue::Single(*i as f32)),
            _ => None,
        }
    }
}

/// A packed native value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeValue {
    Int(i32),
    Bool(bool),
    Single(f32),
}

/// One entry of the native parameter list handed to the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeParam {
    /// Native parameter id, e.g. `Rest_time_T`.
    pub id: &'static str,
    pub value: NativeValue,
    /// Array index; 0 for scalars.
    pub index: usize,
}

/// Scalar or array parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    /// Array, optionally of a fixed length.
    Array(Option<usize>),
}

/// Computes a derived value from the stored ones.
pub type Derive = fn(&TechniqueParams) -> ParamValue;

/// Technique-wide validation rule beyond the per-parameter checks.
pub type Rule = fn(&TechniqueParams, &DeviceInfo) -> Vec<ValidationError>;

/// Structured-form converter for a stored parameter.
pub type FromStructured = fn(&Value) -> Result<ParamValue, String>;

/// Where a parameter value comes from.
#[derive(Debug, Clone)]
pub enum ParamSource {
    Stored { default: Option<ParamValue> },
    Derived(Derive),
    Constant(ParamValue),
}

/// Allowed numeric range, fixed or depending on the device.
#[derive(Debug, Clone, Copy)]
pub enum RangeRule {
    Fixed(DataRange),
    PerDevice(fn(&DeviceInfo) -> DataRange),
}

impl RangeRule {
    pub fn resolve(&self, device: &DeviceInfo) -> DataRange {
        match self {
            Self::Fixed(range) => *range,
            Self::PerDevice(rule) => rule(device),
        }
    }
}

/// Descriptor of one technique parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: &'static str,
    native: Option<(&'static str, PackType)>,
    kind: Option<ValueKind>,
    shape: Shape,
    units: Option<&'static str>,
    range: Option<RangeRule>,
    supports: Option<fn(&DeviceInfo) -> bool>,
    source: ParamSource,
    from_structured: Option<FromStructured>,
}

impl Parameter {
    fn with_source(name: &'static str, source: ParamSource) -> Self {
        Self {
            name,
            native: None,
            kind: None,
            shape: Shape::Scalar,
            units: None,
            range: None,
            supports: None,
            source,
            from_structured: None,
        }
    }

    /// A parameter holding a caller-provided value.
    pub fn stored(name: &'static str) -> Self {
        Self::with_source(name, ParamSource::Stored { default: None })
    }

    /// A read-only parameter computed from the stored ones.
    pub fn derived(name: &'static str, derive: Derive) -> Self {
        Self::with_source(name, ParamSource::Derived(derive))
    }

    /// A read-only parameter with a fixed value.
    pub fn constant(name: &'static str, value: impl Into<ParamValue>) -> Self {
        Self::with_source(name, ParamSource::Constant(value.into()))
    }

    pub fn native(mut self, id: &'static str, pack: PackType) -> Self {
        self.native = Some((id, pack));
        self
    }

    pub fn number(mut self) -> Self {
        self.kind = Some(ValueKind::Number);
        self
    }

    pub fn integer(mut self) -> Self {
        self.kind = Some(ValueKind::Integer);
        self
    }

    pub fn boolean(mut self) -> Self {
        self.kind = Some(ValueKind::Bool);
        self
    }

    /// Member of `E`, written by name in the structured form and packed as its code.
    pub fn enumeration<E: NativeEnum>(mut self) -> Self {
        self.kind = Some(ValueKind::Enum(E::TYPE_NAME));
        self.from_structured = Some(parse_enum::<E>);
        self
    }

    pub fn units(mut self, units: &'static str) -> Self {
        self.units = Some(units);
        self
    }

    pub fn range(mut self, range: DataRange) -> Self {
        self.range = Some(RangeRule::Fixed(range));
        self
    }

    pub fn range_for(mut self, rule: fn(&DeviceInfo) -> DataRange) -> Self {
        self.range = Some(RangeRule::PerDevice(rule));
        self
    }

    pub fn array(mut self) -> Self {
        self.shape = Shape::Array(None);
        self
    }

    pub fn array_of(mut self, len: usize) -> Self {
        self.shape = Shape::Array(Some(len));
        self
    }

    /// Default for a stored parameter. Ignored for derived and constant ones.
    pub fn default(mut self, value: impl Into<ParamValue>) -> Self {
        if let ParamSource::Stored { default } = &mut self.source {
            *default = Some(value.into());
        }
        self
    }

    /// Only pack this parameter for devices accepted by `predicate`.
    pub fn only_on(mut self, predicate: fn(&DeviceInfo) -> bool) -> Self {
        self.supports = Some(predicate);
        self
    }

    pub fn from_structured(mut self, convert: FromStructured) -> Self {
        self.from_structured = Some(convert);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn native_id(&self) -> Option<&'static str> {
        self.native.map(|(id, _)| id)
    }

    pub fn pack_type(&self) -> Option<PackType> {
        self.native.map(|(_, pack)| pack)
    }

    pub fn kind(&self) -> Option<ValueKind> {
        self.kind
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn unit(&self) -> Option<&'static str> {
        self.units
    }

    pub fn range_on(&self, device: &DeviceInfo) -> Option<DataRange> {
        self.range.as_ref().map(|rule| rule.resolve(device))
    }

    pub fn source(&self) -> &ParamSource {
        &self.source
    }

    pub fn is_stored(&self) -> bool {
        matches!(self.source, ParamSource::Stored { .. })
    }

    pub fn default_value(&self) -> Option<&ParamValue> {
        match &self.source {
            ParamSource::Stored { default } => default.as_ref(),
            _ => None,
        }
    }

    pub fn supports_device(&self, device: &DeviceInfo) -> bool {
        self.supports.map_or(true, |predicate| predicate(device))
    }

    /// Checks `value` against this descriptor. Collects every problem.
    pub fn validate(&self, value: &ParamValue, device: &DeviceInfo) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if value.is_null() {
            if self.is_stored() {
                errors.push(ValidationError::new(self.name, "is required but has no value"));
            }
            return errors;
        }
        match (self.shape, value) {
            (Shape::Scalar, ParamValue::List(_)) => {
                let expected = self.kind.map_or("a scalar", ValueKind::describe);
                errors.push(ValidationError::new(
                    self.name,
                    format!(
                        "incorrect type, value must be of type {expected} but List was given instead"
                    ),
                ));
            }
            (Shape::Scalar, scalar) => {
                self.check_element(self.name.to_string(), scalar, device, &mut errors);
            }
            (Shape::Array(len), ParamValue::List(items)) => {
                if let Some(len) = len {
                    if items.len() != len {
                        errors.push(ValidationError::new(
                            self.name,
                            format!(
                                "value must contain exactly {len} elements but {} were given",
                                items.len()
                            ),
                        ));
                    }
                }
                for (idx, item) in items.iter().enumerate() {
                    self.check_element(format!("{}[{idx}]", self.name), item, device, &mut errors);
                }
            }
            (Shape::Array(_), other) => {
                errors.push(ValidationError::new(
                    self.name,
                    format!(
                        "incorrect type, value must be a List but {} was given instead",
                        other.type_name()
                    ),
                ));
            }
        }
        errors
    }

    fn check_element(
        &self,
        label: String,
        value: &ParamValue,
        device: &DeviceInfo,
        errors: &mut Vec<ValidationError>,
    ) {
        if let Some(kind) = self.kind {
            if !kind.accepts(value) {
                errors.push(ValidationError::new(
                    label,
                    format!(
                        "incorrect type, value must be of type {} but {} was given instead",
                        kind.describe(),
                        value.type_name()
                    ),
                ));
                return;
            }
        }
        if let (Some(range), Some(number)) = (self.range_on(device), value.as_f64()) {
            if !range.contains(number) {
                errors.push(ValidationError::new(label, format!("value not in range: {range}")));
            }
        }
    }

    fn pack_into(&self, value: &ParamValue, out: &mut Vec<NativeParam>) -> DaqResult<()> {
        let Some((id, pack)) = self.native else {
            return Ok(());
        };
        let mut push = |element: &ParamValue, index: usize| -> DaqResult<()> {
            let packed = pack.pack(element).ok_or_else(|| {
                DaqError::conversion(
                    self.name,
                    format!("cannot pack {} as {pack:?}", element.type_name()),
                )
            })?;
            out.push(NativeParam {
                id,
                value: packed,
                index,
            });
            Ok(())
        };
        match value {
            ParamValue::List(items) => {
                for (index, item) in items.iter().enumerate() {
                    push(item, index)?;
                }
                Ok(())
            }
            scalar => push(scalar, 0),
        }
    }
}

/// Ordered, name-unique registry of parameter descriptors.
#[derive(Debug)]
pub struct ParamSchema {
    name: &'static str,
    params: Vec<Parameter>,
    rules: Vec<Rule>,
}

impl ParamSchema {
    pub fn new(name: &'static str, params: Vec<Parameter>) -> Self {
        let mut schema = Self {
            name,
            params: Vec::with_capacity(params.len()),
            rules: Vec::new(),
        };
        schema.overlay(params);
        schema
    }

    /// Child schema: inherits `parent`'s parameters and rules, replacing parameters
    /// that share a name and appending the rest in declaration order.
    pub fn extend(parent: &ParamSchema, name: &'static str, params: Vec<Parameter>) -> Self {
        let mut schema = Self {
            name,
            params: parent.params.clone(),
            rules: parent.rules.clone(),
        };
        schema.overlay(params);
        schema
    }

    fn overlay(&mut self, params: Vec<Parameter>) {
        for param in params {
            match self.params.iter_mut().find(|p| p.name == param.name) {
                Some(existing) => *existing = param,
                None => self.params.push(param),
            }
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// All parameters, inherited ones first.
    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Concrete values of one configured technique.
#[derive(Clone)]
pub struct TechniqueParams {
    schema: &'static ParamSchema,
    values: BTreeMap<&'static str, ParamValue>,
}

impl TechniqueParams {
    /// New parameter set holding the declared defaults.
    pub fn new(schema: &'static ParamSchema) -> Self {
        let values = schema
            .params
            .iter()
            .filter_map(|p| p.default_value().map(|v| (p.name, v.clone())))
            .collect();
        Self { schema, values }
    }

    pub fn schema(&self) -> &'static ParamSchema {
        self.schema
    }

    /// Assigns a stored parameter.
    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) -> DaqResult<()> {
        let param = self
            .schema
            .get(name)
            .ok_or_else(|| DaqError::UnknownParameter(name.to_string()))?;
        if !param.is_stored() {
            return Err(DaqError::ReadOnlyParameter(name.to_string()));
        }
        self.values.insert(param.name, value.into());
        Ok(())
    }

    /// Builder form of [`TechniqueParams::set`].
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> DaqResult<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Current value of any declared parameter.
    pub fn get(&self, name: &str) -> DaqResult<ParamValue> {
        self.schema
            .get(name)
            .map(|p| self.value_of(p))
            .ok_or_else(|| DaqError::UnknownParameter(name.to_string()))
    }

    /// Current value, `Null` when unknown or unset.
    pub fn value(&self, name: &str) -> ParamValue {
        self.schema
            .get(name)
            .map(|p| self.value_of(p))
            .unwrap_or_default()
    }

    fn value_of(&self, param: &Parameter) -> ParamValue {
        match &param.source {
            ParamSource::Stored { .. } => self.values.get(param.name).cloned().unwrap_or_default(),
            ParamSource::Derived(derive) => derive(self),
            ParamSource::Constant(value) => value.clone(),
        }
    }

    pub fn enum_value<E: NativeEnum>(&self, name: &str) -> Option<E> {
        E::from_param(&self.value(name))
    }

    /// `field` of every record in the list parameter `list`.
    pub fn list_field(&self, list: &str, field: &str) -> ParamValue {
        match self.value(list) {
            ParamValue::List(items) => ParamValue::List(items.iter().map(|i| i.field(field)).collect()),
            _ => ParamValue::List(Vec::new()),
        }
    }

    /// `field` of each named record parameter, in the given order.
    pub fn records_field(&self, records: &[&str], field: &str) -> ParamValue {
        ParamValue::List(records.iter().map(|r| self.value(r).field(field)).collect())
    }

    /// Every problem with the current values, per parameter then per technique rule.
    pub fn validate(&self, device: &DeviceInfo) -> Vec<ValidationError> {
        let mut errors: Vec<ValidationError> = self
            .schema
            .params
            .iter()
            .flat_map(|p| p.validate(&self.value_of(p), device))
            .collect();
        for rule in &self.schema.rules {
            errors.extend(rule(self, device));
        }
        errors
    }

    /// Native parameter list for `device`.
    pub fn pack(&self, device: &DeviceInfo) -> DaqResult<Vec<NativeParam>> {
        let mut packed = Vec::new();
        for param in &self.schema.params {
            if param.native.is_none() || !param.supports_device(device) {
                continue;
            }
            let value = self.value_of(param);
            if value.is_null() {
                return Err(DaqError::conversion(param.name, "no value to pack"));
            }
            param.pack_into(&value, &mut packed)?;
        }
        Ok(packed)
    }

    /// Structured form of the stored values. Absent values are omitted.
    pub fn to_structured(&self) -> Value {
        let mut map = Map::new();
        for param in self.schema.params.iter().filter(|p| p.is_stored()) {
            if let Some(value) = self.values.get(param.name) {
                let json = value.to_json();
                if !json.is_null() {
                    map.insert(param.name.to_string(), json);
                }
            }
        }
        Value::Object(map)
    }

    /// Rebuilds a parameter set from its structured form.
    ///
    /// Unknown names are ignored. Missing values fall back to the declared default;
    /// a missing value without default is an error naming the parameter.
    pub fn from_structured(schema: &'static ParamSchema, value: &Value) -> DaqResult<Self> {
        let Value::Object(map) = value else {
            return Err(DaqError::conversion(
                schema.name,
                format!("expected an object of parameters, got {value}"),
            ));
        };
        let mut values = BTreeMap::new();
        for param in schema.params.iter().filter(|p| p.is_stored()) {
            let converted = match map.get(param.name) {
                Some(raw) => match param.from_structured {
                    Some(convert) => {
                        convert(raw).map_err(|msg| DaqError::conversion(param.name, msg))?
                    }
                    None => ParamValue::from_json(raw),
                },
                None => ParamValue::Null,
            };
            let resolved = match converted {
                ParamValue::Null => param.default_value().cloned().ok_or_else(|| {
                    DaqError::conversion(param.name, "missing value and no default")
                })?,
                value => value,
            };
            values.insert(param.name, resolved);
        }
        for key in map.keys() {
            if !schema.get(key).is_some_and(Parameter::is_stored) {
                debug!(technique = schema.name, param = %key, "Ignoring non-settable parameter");
            }
        }
        Ok(Self { schema, values })
    }
}

impl PartialEq for TechniqueParams {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.schema, other.schema) && self.values == other.values
    }
}

impl fmt::Debug for TechniqueParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TechniqueParams")
            .field("schema", &self.schema.name)
            .field("values", &self.values)
            .finish()
    }
}
