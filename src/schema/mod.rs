//! Declarative schema engine for technique parameters and result records.
//!
//! Parameters are described once per technique by [`Parameter`] descriptors collected
//! in a [`ParamSchema`]. A configured [`TechniqueParams`] can then be
//!
//! - validated against a connected device, collecting every [`ValidationError`],
//! - packed into the native parameter list the instrument loads,
//! - converted to and from the portable structured form (`serde_json::Value`).
//!
//! Result records are plain serde types described by a [`RecordSchema`].

mod fields;
mod params;
mod range;
mod value;

pub use fields::{Field, RecordSchema};
pub use params::{
    Derive, FromStructured, NativeParam, NativeValue, PackType, ParamSchema, ParamSource,
    Parameter, RangeRule, Rule, Shape, TechniqueParams, ValidationError,
};
pub use range::DataRange;
pub use value::{parse_enum, EnumValue, NativeEnum, ParamValue, ValueKind};

pub(crate) use value::native_enum;
