//! Technique registry.
//!
//! A technique is an electrochemical measurement program the instrument runs on a
//! channel. Each variant declares, in a static [`TechniqueSpec`]:
//!
//! - its native id ([`TechId`]),
//! - its parameter schema (the common base schema overlaid with its own parameters),
//! - its result record schema,
//! - its timebase and program file, per device family,
//! - an unpack routine turning one [`RawFrame`] into typed [`TechniqueData`] records.
//!
//! A configured [`Technique`] pairs a [`TechniqueKind`] with its [`TechniqueParams`].
//!
//! # Example
//! ```no_run
//! use potentiostat_daq::techniques::{Technique, TechniqueKind};
//!
//! # fn main() -> potentiostat_daq::DaqResult<()> {
//! let ocv = Technique::new(TechniqueKind::Ocv)
//!     .with("rest_time_T", 10.0)?
//!     .with("record_every_dE", 0.01)?
//!     .with("record_every_dT", 0.5)?;
//! println!("{}", ocv.to_structured());
//! # Ok(())
//! # }
//! ```

mod ca;
mod common;
mod cp;
mod cpp;
mod cv;
mod lp;
mod ocv;
mod peis;
mod pzir;

pub use ca::{CaData, CaStep};
pub use cp::{CpData, CpStep};
pub use cpp::{CppData, CppRestData, CppScanData};
pub use cv::{CvData, CvStep};
pub use lp::{LpData, LpRestData, LpScanData, LpStep};
pub use ocv::OcvData;
pub use peis::{PeisData, PeisProcess0Data, PeisProcess1Data, SweepMode};
pub use pzir::{PzirData, RcmpMode};

use crate::device::{DeviceFamily, DeviceInfo, IRange, Bandwidth, RawFrame};
use crate::error::{DaqError, DaqResult};
use crate::schema::{
    native_enum, NativeEnum, NativeParam, ParamSchema, ParamValue, RecordSchema,
    TechniqueParams, ValidationError,
};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;

native_enum! {
    /// Native technique identifiers.
    pub enum TechId as "TechId" {
        NoTechnique = 0 => "NONE",
        Ocv = 100 => "OCV",
        Ca = 101 => "CA",
        Cp = 102 => "CP",
        Cv = 103 => "CV",
        Peis = 104 => "PEIS",
        Lp = 134 => "LP",
        Cpp = 136 => "CPP",
        Pzir = 141 => "PZIR",
    }
}

/// Seconds per tick of the technique clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timebase {
    Fixed(f64),
    PerFamily { vmp3: f64, sp300: f64 },
}

impl Timebase {
    pub fn on(self, family: DeviceFamily) -> f64 {
        match (self, family) {
            (Self::Fixed(tb), _) => tb,
            (Self::PerFamily { vmp3, .. }, DeviceFamily::Vmp3) => vmp3,
            (Self::PerFamily { sp300, .. }, DeviceFamily::Sp300) => sp300,
        }
    }
}

/// Turns one raw frame into records.
pub type Unpack = fn(&DeviceInfo, &RawFrame) -> DaqResult<Vec<TechniqueData>>;

/// Static declaration of a technique variant.
pub struct TechniqueSpec {
    pub id: TechId,
    pub description: &'static str,
    pub timebase: Timebase,
    pub vmp3_program: Option<&'static str>,
    pub sp300_program: Option<&'static str>,
    pub params: &'static Lazy<ParamSchema>,
    pub record: &'static Lazy<RecordSchema>,
    pub unpack: Unpack,
}

impl TechniqueSpec {
    pub fn program(&self, family: DeviceFamily) -> Option<&'static str> {
        match family {
            DeviceFamily::Vmp3 => self.vmp3_program,
            DeviceFamily::Sp300 => self.sp300_program,
        }
    }
}

impl fmt::Debug for TechniqueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TechniqueSpec")
            .field("id", &self.id)
            .field("timebase", &self.timebase)
            .field("vmp3_program", &self.vmp3_program)
            .field("sp300_program", &self.sp300_program)
            .finish_non_exhaustive()
    }
}

/// The closed set of supported techniques.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TechniqueKind {
    Ocv,
    Ca,
    Cp,
    Cv,
    Peis,
    Lp,
    Cpp,
    Pzir,
}

impl TechniqueKind {
    pub fn all() -> &'static [TechniqueKind] {
        &[
            Self::Ocv,
            Self::Ca,
            Self::Cp,
            Self::Cv,
            Self::Peis,
            Self::Lp,
            Self::Cpp,
            Self::Pzir,
        ]
    }

    pub fn spec(self) -> &'static TechniqueSpec {
        match self {
            Self::Ocv => &ocv::SPEC,
            Self::Ca => &ca::SPEC,
            Self::Cp => &cp::SPEC,
            Self::Cv => &cv::SPEC,
            Self::Peis => &peis::SPEC,
            Self::Lp => &lp::SPEC,
            Self::Cpp => &cpp::SPEC,
            Self::Pzir => &pzir::SPEC,
        }
    }

    pub fn id(self) -> TechId {
        self.spec().id
    }

    /// Symbolic name, e.g. `OCV`.
    pub fn name(self) -> &'static str {
        self.id().name()
    }

    pub fn from_id(id: TechId) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.id() == id)
    }

    pub fn from_code(code: i32) -> Option<Self> {
        TechId::from_code(code).and_then(Self::from_id)
    }

    /// Lookup by symbolic name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(name))
    }

    /// Technique whose program file is `program`, on any family.
    pub fn from_program(program: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| {
            let spec = k.spec();
            spec.vmp3_program == Some(program) || spec.sp300_program == Some(program)
        })
    }

    pub fn params_schema(self) -> &'static ParamSchema {
        self.spec().params
    }

    pub fn record_schema(self) -> &'static RecordSchema {
        self.spec().record
    }
}

impl fmt::Display for TechniqueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One configured technique.
#[derive(Debug, Clone, PartialEq)]
pub struct Technique {
    kind: TechniqueKind,
    params: TechniqueParams,
}

impl Technique {
    /// Technique with default parameter values.
    pub fn new(kind: TechniqueKind) -> Self {
        Self {
            kind,
            params: TechniqueParams::new(kind.params_schema()),
        }
    }

    /// Pairs `kind` with parameters built from its schema.
    pub fn from_params(kind: TechniqueKind, params: TechniqueParams) -> DaqResult<Self> {
        if !std::ptr::eq(params.schema(), kind.params_schema()) {
            return Err(DaqError::Precondition(format!(
                "parameters of {} cannot configure {kind}",
                params.schema().name()
            )));
        }
        Ok(Self { kind, params })
    }

    /// Sets a stored parameter, builder style.
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> DaqResult<Self> {
        self.params.set(name, value)?;
        Ok(self)
    }

    pub fn kind(&self) -> TechniqueKind {
        self.kind
    }

    pub fn id(&self) -> TechId {
        self.kind.id()
    }

    pub fn params(&self) -> &TechniqueParams {
        &self.params
    }

    pub fn timebase(&self, device: &DeviceInfo) -> f64 {
        self.kind.spec().timebase.on(device.family)
    }

    /// Program file for the device, or a precondition error when unsupported.
    pub fn program_file(&self, device: &DeviceInfo) -> DaqResult<&'static str> {
        self.kind.spec().program(device.family).ok_or_else(|| {
            DaqError::Precondition(format!("{} is not supported on {}", self.kind, device.family))
        })
    }

    pub fn is_device_supported(&self, device: &DeviceInfo) -> bool {
        self.kind.spec().program(device.family).is_some()
    }

    pub fn validate(&self, device: &DeviceInfo) -> Vec<ValidationError> {
        self.params.validate(device)
    }

    pub fn pack(&self, device: &DeviceInfo) -> DaqResult<Vec<NativeParam>> {
        self.params.pack(device)
    }

    pub fn unpack(&self, device: &DeviceInfo, frame: &RawFrame) -> DaqResult<Vec<TechniqueData>> {
        (self.kind.spec().unpack)(device, frame)
    }

    /// Requested current range; `None` when the value is not an `IRange`.
    pub fn i_range(&self) -> Option<IRange> {
        self.params.enum_value("I_range")
    }

    pub fn bandwidth(&self) -> Option<Bandwidth> {
        self.params.enum_value("bandwidth")
    }

    /// `{tech_id, params}` structured form.
    pub fn to_structured(&self) -> Value {
        json!({
            "tech_id": self.kind.name(),
            "params": self.params.to_structured(),
        })
    }

    /// Parses a `{tech_id, params}` description. `tech_id` is a name or a numeric id.
    pub fn from_structured(value: &Value) -> DaqResult<Self> {
        let kind = match value.get("tech_id") {
            Some(Value::String(name)) => TechniqueKind::from_name(name)
                .ok_or_else(|| DaqError::UnknownTechnique(name.clone()))?,
            Some(Value::Number(code)) => code
                .as_i64()
                .and_then(|c| i32::try_from(c).ok())
                .and_then(TechniqueKind::from_code)
                .ok_or_else(|| DaqError::UnknownTechnique(code.to_string()))?,
            Some(other) => return Err(DaqError::UnknownTechnique(other.to_string())),
            None => return Err(DaqError::conversion("tech_id", "missing technique id")),
        };
        let params = value.get("params").cloned().unwrap_or_else(|| json!({}));
        let params = TechniqueParams::from_structured(kind.params_schema(), &params)?;
        Ok(Self { kind, params })
    }
}

/// One record emitted by a technique.
#[derive(Debug, Clone, PartialEq)]
pub enum TechniqueData {
    Ocv(OcvData),
    Ca(CaData),
    Cp(CpData),
    Cv(CvData),
    Peis(PeisData),
    Lp(LpData),
    Cpp(CppData),
    Pzir(PzirData),
}

impl TechniqueData {
    pub fn kind(&self) -> TechniqueKind {
        match self {
            Self::Ocv(_) => TechniqueKind::Ocv,
            Self::Ca(_) => TechniqueKind::Ca,
            Self::Cp(_) => TechniqueKind::Cp,
            Self::Cv(_) => TechniqueKind::Cv,
            Self::Peis(_) => TechniqueKind::Peis,
            Self::Lp(_) => TechniqueKind::Lp,
            Self::Cpp(_) => TechniqueKind::Cpp,
            Self::Pzir(_) => TechniqueKind::Pzir,
        }
    }

    /// Seconds since the experiment started, when the record carries it.
    pub fn total_time(&self) -> Option<f64> {
        match self {
            Self::Ocv(d) => Some(d.total_time),
            Self::Ca(d) => Some(d.total_time),
            Self::Cp(d) => Some(d.total_time),
            Self::Cv(d) => Some(d.total_time),
            Self::Peis(PeisData::Process0(d)) => Some(d.total_time),
            Self::Peis(PeisData::Process1(d)) => Some(d.total_time),
            Self::Lp(d) => Some(d.total_time()),
            Self::Cpp(d) => Some(d.total_time()),
            Self::Pzir(_) => None,
        }
    }

    /// Layout of `process_data` for multi-phase records.
    pub fn process_schema(&self) -> Option<&'static RecordSchema> {
        match self {
            Self::Peis(d) => PeisData::process_schema(d.process_index()),
            Self::Lp(d) | Self::Cpp(d) => LpData::process_schema(d.process_index()),
            _ => None,
        }
    }

    /// Structured form. Multi-phase records use `{process_index, process_data}`.
    pub fn to_structured(&self) -> Value {
        match self {
            Self::Ocv(d) => record_to_structured(d),
            Self::Ca(d) => record_to_structured(d),
            Self::Cp(d) => record_to_structured(d),
            Self::Cv(d) => record_to_structured(d),
            Self::Peis(d) => d.to_structured(),
            Self::Lp(d) => d.to_structured(),
            Self::Cpp(d) => d.to_structured(),
            Self::Pzir(d) => record_to_structured(d),
        }
    }

    pub fn from_structured(kind: TechniqueKind, value: &Value) -> DaqResult<Self> {
        Ok(match kind {
            TechniqueKind::Ocv => Self::Ocv(record_from_structured(kind, value)?),
            TechniqueKind::Ca => Self::Ca(record_from_structured(kind, value)?),
            TechniqueKind::Cp => Self::Cp(record_from_structured(kind, value)?),
            TechniqueKind::Cv => Self::Cv(record_from_structured(kind, value)?),
            TechniqueKind::Peis => Self::Peis(PeisData::from_structured(value)?),
            TechniqueKind::Lp => Self::Lp(LpData::from_structured(value)?),
            TechniqueKind::Cpp => Self::Cpp(LpData::from_phase("CPP", value)?),
            TechniqueKind::Pzir => Self::Pzir(record_from_structured(kind, value)?),
        })
    }
}

fn record_to_structured<T: Serialize>(record: &T) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

fn record_from_structured<T: DeserializeOwned>(kind: TechniqueKind, value: &Value) -> DaqResult<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| DaqError::conversion(format!("{kind} record"), e.to_string()))
}

/// `{process_index, process_data}` form of one phase record.
fn phase_to_structured<T: Serialize>(process_index: u32, data: &T) -> Value {
    json!({
        "process_index": process_index,
        "process_data": record_to_structured(data),
    })
}

/// Splits a `{process_index, process_data}` value.
fn phase_from_structured<'a>(technique: &str, value: &'a Value) -> DaqResult<(u64, &'a Value)> {
    let index = value
        .get("process_index")
        .and_then(Value::as_u64)
        .ok_or_else(|| DaqError::conversion(format!("{technique} process_index"), "missing or not an integer"))?;
    let data = value
        .get("process_data")
        .ok_or_else(|| DaqError::conversion(format!("{technique} process_data"), "missing"))?;
    Ok((index, data))
}

fn phase_record<T: DeserializeOwned>(technique: &str, value: &Value) -> DaqResult<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| DaqError::conversion(format!("{technique} process_data"), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::sample_row;
    use crate::device::test_support::{sp300_device, vmp3_device};
    use crate::device::ProgState;

    fn assert_keys_match(schema: &RecordSchema, value: &Value, context: &str) {
        let Some(object) = value.as_object() else { panic!("{context}: not an object") };
        for key in object.keys() {
            assert!(schema.get(key).is_some(), "{context}: {key} is not declared");
        }
        for field in schema.fields().iter().filter(|f| !f.optional) {
            assert!(object.contains_key(field.name), "{context}: {} is missing", field.name);
        }
    }

    #[test]
    fn registry_lookups() {
        assert_eq!(TechniqueKind::all().len(), 8);
        assert_eq!(TechniqueKind::from_name("cv"), Some(TechniqueKind::Cv));
        assert_eq!(TechniqueKind::from_code(141), Some(TechniqueKind::Pzir));
        assert_eq!(TechniqueKind::from_code(0), None);
        assert_eq!(TechniqueKind::from_program("cpp4.ecc"), Some(TechniqueKind::Cpp));
        for kind in TechniqueKind::all() {
            assert_eq!(TechniqueKind::from_id(kind.id()), Some(*kind));
        }
    }

    #[test]
    fn programs_and_timebases_follow_family() {
        let cv = Technique::new(TechniqueKind::Cv);
        assert_eq!(cv.program_file(&vmp3_device()).unwrap(), "cv.ecc");
        assert_eq!(cv.program_file(&sp300_device()).unwrap(), "cv4.ecc");
        assert_eq!(cv.timebase(&vmp3_device()), 40e-6);
        assert_eq!(cv.timebase(&sp300_device()), 45e-6);
        assert!(cv.is_device_supported(&sp300_device()));
    }

    #[test]
    fn common_parameters_come_first() {
        let schema = TechniqueKind::Ocv.params_schema();
        let names: Vec<_> = schema.parameters().iter().map(|p| p.name()).collect();
        assert_eq!(&names[..3], ["E_range", "I_range", "bandwidth"]);
    }

    #[test]
    fn structured_technique_round_trip() {
        let ocv = Technique::new(TechniqueKind::Ocv)
            .with("rest_time_T", 10.0)
            .unwrap()
            .with("record_every_dE", 0.01)
            .unwrap()
            .with("record_every_dT", 0.5)
            .unwrap();
        let value = ocv.to_structured();
        assert_eq!(value["tech_id"], "OCV");
        assert_eq!(value["params"]["I_range"], "I_RANGE_AUTO");
        assert_eq!(Technique::from_structured(&value).unwrap(), ocv);
    }

    #[test]
    fn unknown_technique_is_rejected() {
        let err = Technique::from_structured(&json!({"tech_id": "XYZ", "params": {}})).unwrap_err();
        assert!(matches!(err, DaqError::UnknownTechnique(name) if name == "XYZ"));
    }

    #[test]
    fn record_schemas_describe_structured_records() {
        for device in [vmp3_device(), sp300_device()] {
            for &kind in TechniqueKind::all() {
                let phases: &[u32] = match kind {
                    TechniqueKind::Peis | TechniqueKind::Lp | TechniqueKind::Cpp => &[0, 1],
                    _ => &[0],
                };
                for &process_index in phases {
                    let timebase = kind.spec().timebase.on(device.family);
                    let cells =
                        sample_row(kind, device.family, process_index, timebase, 2.0, 7.0, 3);
                    let frame = RawFrame {
                        state: ProgState::Run,
                        tech_index: 0,
                        tech_id: kind.id().code(),
                        process_index,
                        start_time: 5.0,
                        timebase,
                        rows: 1,
                        cols: cells.len(),
                        data: cells,
                    };
                    let records = Technique::new(kind).unpack(&device, &frame).unwrap();
                    assert_eq!(records.len(), 1);

                    let context = format!("{kind} on {:?} process {process_index}", device.family);
                    let value = records[0].to_structured();
                    assert_keys_match(kind.record_schema(), &value, &context);
                    match records[0].process_schema() {
                        Some(schema) => assert_keys_match(schema, &value["process_data"], &context),
                        None => assert!(value.get("process_data").is_none(), "{context}"),
                    }
                }
            }
        }
    }

    #[test]
    fn from_params_checks_schema() {
        let params = TechniqueParams::new(TechniqueKind::Ocv.params_schema());
        assert!(Technique::from_params(TechniqueKind::Ocv, params.clone()).is_ok());
        assert!(Technique::from_params(TechniqueKind::Ca, params).is_err());
    }
}
