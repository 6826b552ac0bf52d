//! Cyclic Voltammetry.
//!
//! Sweeps the potential from `Ei` to `E1`, then cycles between `E1` and `E2`
//! before finishing at `Ef`.

use super::common::{row_width, Row, COMMON, TIME_SERIES};
use super::{TechId, TechniqueData, TechniqueSpec, Timebase};
use crate::device::{DeviceFamily, DeviceInfo, RawFrame};
use crate::error::DaqResult;
use crate::schema::{
    DataRange, Field, PackType, ParamSchema, ParamValue, Parameter, RecordSchema,
    TechniqueParams,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const TIMEBASE: Timebase = Timebase::PerFamily {
    vmp3: 40e-6,
    sp300: 45e-6,
};

/// Vertices in instrument order. The initial vertex is revisited after each cycle.
const VERTICES: [&str; 5] = ["Ei", "E1", "E2", "Ei", "Ef"];

/// One sweep vertex.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvStep {
    /// Potential in V.
    pub voltage: f64,
    /// Scan rate in mV/s.
    pub scan_rate: f64,
    pub vs_initial: bool,
}

impl From<CvStep> for ParamValue {
    fn from(step: CvStep) -> Self {
        ParamValue::Record(BTreeMap::from([
            ("voltage".to_string(), ParamValue::Float(step.voltage)),
            ("scan_rate".to_string(), ParamValue::Float(step.scan_rate)),
            ("vs_initial".to_string(), ParamValue::Bool(step.vs_initial)),
        ]))
    }
}

fn parse_step(value: &Value) -> Result<ParamValue, String> {
    let step: CvStep = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    Ok(step.into())
}

fn vs_initial(params: &TechniqueParams) -> ParamValue {
    params.records_field(&VERTICES, "vs_initial")
}

fn voltage_step(params: &TechniqueParams) -> ParamValue {
    params.records_field(&VERTICES, "voltage")
}

fn scan_rate(params: &TechniqueParams) -> ParamValue {
    params.records_field(&VERTICES, "scan_rate")
}

fn vertex(name: &'static str) -> Parameter {
    Parameter::stored(name).from_structured(parse_step)
}

pub(super) static PARAMS: Lazy<ParamSchema> = Lazy::new(|| {
    ParamSchema::extend(
        &COMMON,
        "CV",
        vec![
            Parameter::constant("scan_number", 2i64).native("Scan_number", PackType::Int),
            Parameter::stored("record_every_dE")
                .native("Record_every_dE", PackType::Single)
                .number()
                .units("V")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("average_over_dE")
                .native("Average_over_dE", PackType::Bool)
                .boolean(),
            Parameter::stored("n_cycles")
                .native("N_Cycles", PackType::Int)
                .integer()
                .range(DataRange::at_least(0.0)),
            Parameter::stored("begin_measuring_i")
                .native("Begin_measuring_I", PackType::Single)
                .number()
                .range(DataRange::new(0.0, 1.0)),
            Parameter::stored("end_measuring_i")
                .native("End_measuring_I", PackType::Single)
                .number()
                .range(DataRange::new(0.0, 1.0)),
            vertex("Ei"),
            vertex("E1"),
            vertex("E2"),
            vertex("Ef"),
            Parameter::derived("vs_initial", vs_initial)
                .native("vs_initial", PackType::Bool)
                .boolean()
                .array_of(VERTICES.len()),
            Parameter::derived("voltage_step", voltage_step)
                .native("Voltage_step", PackType::Single)
                .number()
                .array_of(VERTICES.len())
                .units("V"),
            Parameter::derived("scan_rate", scan_rate)
                .native("Scan_Rate", PackType::Single)
                .number()
                .array_of(VERTICES.len())
                .units("mV/s")
                .range(DataRange::at_least(0.0)),
        ],
    )
});

pub(super) static RECORD: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::extend(
        &TIME_SERIES,
        "CV",
        &[
            Field::new("Ec", "V").optional(),
            Field::new("I_avg", "A"),
            Field::new("Ewe_avg", "V"),
            Field::unitless("cycle"),
        ],
    )
});

pub(super) static SPEC: TechniqueSpec = TechniqueSpec {
    id: TechId::Cv,
    description: "Cyclic Voltammetry",
    timebase: TIMEBASE,
    vmp3_program: Some("cv.ecc"),
    sp300_program: Some("cv4.ecc"),
    params: &PARAMS,
    record: &RECORD,
    unpack,
};

/// One CV sample. Current and potential are averaged over the measuring window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvData {
    pub time: f64,
    pub total_time: f64,
    /// Control potential, VMP3 series only.
    #[serde(rename = "Ec", default, skip_serializing_if = "Option::is_none")]
    pub ec: Option<f64>,
    #[serde(rename = "I_avg")]
    pub i_avg: f64,
    #[serde(rename = "Ewe_avg")]
    pub ewe_avg: f64,
    pub cycle: u32,
}

fn unpack(device: &DeviceInfo, frame: &RawFrame) -> DaqResult<Vec<TechniqueData>> {
    let width = row_width(device, 6, 5);
    let vmp3 = device.family == DeviceFamily::Vmp3;
    frame
        .rows()
        .map(|cells| {
            let row = Row::new("CV", cells, width)?;
            let (time, total_time) = row.timestamps(frame);
            // VMP3 rows carry Ec before the averages.
            let base = if vmp3 { 3 } else { 2 };
            Ok(TechniqueData::Cv(CvData {
                time,
                total_time,
                ec: vmp3.then(|| row.single(2)),
                i_avg: row.single(base),
                ewe_avg: row.single(base + 1),
                cycle: row.raw(base + 2),
            }))
        })
        .collect()
}
