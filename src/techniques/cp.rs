//! Chrono-Potentiometry.
//!
//! Current-controlled counterpart of CA: applies a list of current steps and
//! records the potential response.

use super::ca::{duration_step, step_number, vs_initial};
use super::common::{duration_range, Row, COMMON, TIME_SERIES};
use super::{TechId, TechniqueData, TechniqueSpec, Timebase};
use crate::device::{DeviceInfo, IRange, RawFrame};
use crate::error::DaqResult;
use crate::schema::{
    DataRange, Field, PackType, ParamSchema, ParamValue, Parameter, RecordSchema,
    TechniqueParams, ValidationError,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const TIMEBASE: f64 = 21e-6;

/// One current step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpStep {
    /// Current in A.
    pub current: f64,
    /// Duration in s.
    pub duration: f64,
    pub vs_initial: bool,
}

impl From<CpStep> for ParamValue {
    fn from(step: CpStep) -> Self {
        ParamValue::Record(BTreeMap::from([
            ("current".to_string(), ParamValue::Float(step.current)),
            ("duration".to_string(), ParamValue::Float(step.duration)),
            ("vs_initial".to_string(), ParamValue::Bool(step.vs_initial)),
        ]))
    }
}

fn parse_steps(value: &Value) -> Result<ParamValue, String> {
    let steps: Vec<CpStep> = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    Ok(ParamValue::from(steps))
}

fn current_step(params: &TechniqueParams) -> ParamValue {
    params.list_field("steps", "current")
}

fn no_auto_range(params: &TechniqueParams, _device: &DeviceInfo) -> Vec<ValidationError> {
    match params.enum_value::<IRange>("I_range") {
        Some(IRange::Auto) => vec![ValidationError::new(
            "I_range",
            "I auto-range is not allowed for this technique",
        )],
        _ => Vec::new(),
    }
}

pub(super) static PARAMS: Lazy<ParamSchema> = Lazy::new(|| {
    ParamSchema::extend(
        &COMMON,
        "CP",
        vec![
            Parameter::stored("record_every_dT")
                .native("Record_every_dT", PackType::Single)
                .number()
                .units("s")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("record_every_dE")
                .native("Record_every_dE", PackType::Single)
                .number()
                .units("V")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("n_cycles")
                .native("N_Cycles", PackType::Int)
                .integer()
                .range(DataRange::at_least(0.0)),
            Parameter::stored("steps").array().from_structured(parse_steps),
            Parameter::derived("current_step", current_step)
                .native("Current_step", PackType::Single)
                .number()
                .array()
                .units("A"),
            Parameter::derived("vs_initial", vs_initial)
                .native("vs_initial", PackType::Bool)
                .boolean()
                .array(),
            Parameter::derived("duration_step", duration_step)
                .native("Duration_step", PackType::Single)
                .number()
                .array()
                .units("s")
                .range(duration_range(TIMEBASE)),
            Parameter::derived("step_number", step_number)
                .native("Step_number", PackType::Int)
                .integer()
                .range(DataRange::new(0.0, 98.0)),
        ],
    )
    .with_rule(no_auto_range)
});

pub(super) static RECORD: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::extend(
        &TIME_SERIES,
        "CP",
        &[
            Field::new("Ewe", "V"),
            Field::new("I", "A"),
            Field::unitless("cycle"),
        ],
    )
});

pub(super) static SPEC: TechniqueSpec = TechniqueSpec {
    id: TechId::Cp,
    description: "Chrono-Potentiometry",
    timebase: Timebase::Fixed(TIMEBASE),
    vmp3_program: Some("cp.ecc"),
    sp300_program: Some("cp4.ecc"),
    params: &PARAMS,
    record: &RECORD,
    unpack,
};

/// One CP sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpData {
    pub time: f64,
    pub total_time: f64,
    #[serde(rename = "Ewe")]
    pub ewe: f64,
    #[serde(rename = "I")]
    pub i: f64,
    pub cycle: u32,
}

fn unpack(_device: &DeviceInfo, frame: &RawFrame) -> DaqResult<Vec<TechniqueData>> {
    frame
        .rows()
        .map(|cells| {
            let row = Row::new("CP", cells, 5)?;
            let (time, total_time) = row.timestamps(frame);
            Ok(TechniqueData::Cp(CpData {
                time,
                total_time,
                ewe: row.single(2),
                i: row.single(3),
                cycle: row.raw(4),
            }))
        })
        .collect()
}
