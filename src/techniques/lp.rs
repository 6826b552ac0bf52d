//! Linear Polarization.
//!
//! Used in corrosion monitoring to find the polarization resistance around the
//! corrosion potential. A rest phase (process 0) records the open circuit
//! potential, then a scan phase (process 1) sweeps from `Ei` to `El`.

use super::common::{
    duration_range, phased_record, row_width, unknown_process, Row, COMMON, TIME_SERIES,
};
use super::{
    phase_from_structured, phase_record, phase_to_structured, TechId, TechniqueData,
    TechniqueSpec, Timebase,
};
use crate::device::{DeviceFamily, DeviceInfo, RawFrame};
use crate::error::{DaqError, DaqResult};
use crate::schema::{
    DataRange, Field, PackType, ParamSchema, ParamValue, Parameter, RecordSchema,
    TechniqueParams,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const TIMEBASE: f64 = 40e-6;

const SCANS: [&str; 2] = ["Ei", "El"];

/// One scan vertex.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LpStep {
    /// Potential in V.
    pub voltage_scan: f64,
    /// Scan rate in mV/s.
    pub scan_rate: f64,
    pub vs_initial_scan: bool,
}

impl From<LpStep> for ParamValue {
    fn from(step: LpStep) -> Self {
        ParamValue::Record(BTreeMap::from([
            ("voltage_scan".to_string(), ParamValue::Float(step.voltage_scan)),
            ("scan_rate".to_string(), ParamValue::Float(step.scan_rate)),
            ("vs_initial_scan".to_string(), ParamValue::Bool(step.vs_initial_scan)),
        ]))
    }
}

fn parse_step(value: &Value) -> Result<ParamValue, String> {
    let step: LpStep = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    Ok(step.into())
}

fn vs_initial_scan(params: &TechniqueParams) -> ParamValue {
    params.records_field(&SCANS, "vs_initial_scan")
}

fn voltage_scan(params: &TechniqueParams) -> ParamValue {
    params.records_field(&SCANS, "voltage_scan")
}

fn scan_rate(params: &TechniqueParams) -> ParamValue {
    params.records_field(&SCANS, "scan_rate")
}

pub(super) static PARAMS: Lazy<ParamSchema> = Lazy::new(|| {
    ParamSchema::extend(
        &COMMON,
        "LP",
        vec![
            Parameter::stored("record_every_dEr")
                .native("Record_every_dEr", PackType::Single)
                .number()
                .units("V")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("rest_time_T")
                .native("Rest_time_T", PackType::Single)
                .number()
                .units("s")
                .range(duration_range(TIMEBASE)),
            Parameter::stored("record_every_dTr")
                .native("Record_every_dTr", PackType::Single)
                .number()
                .units("s")
                .range(DataRange::at_least(0.0)),
            Parameter::constant("oc1", false).native("OC1", PackType::Bool),
            Parameter::constant("e1", 0.0)
                .native("E1", PackType::Single)
                .units("V"),
            Parameter::constant("t1", 0.0)
                .native("T1", PackType::Single)
                .units("s"),
            Parameter::stored("Ei").from_structured(parse_step),
            Parameter::stored("El").from_structured(parse_step),
            Parameter::constant("scan_number", 0i64).native("Scan_number", PackType::Int),
            Parameter::stored("record_every_dE")
                .native("Record_every_dE", PackType::Single)
                .number()
                .units("V")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("average_over_dE")
                .native("Average_over_dE", PackType::Bool)
                .boolean(),
            Parameter::stored("begin_measuring_I")
                .native("Begin_measuring_I", PackType::Single)
                .number()
                .range(DataRange::new(0.0, 1.0)),
            Parameter::stored("end_measuring_I")
                .native("End_measuring_I", PackType::Single)
                .number()
                .range(DataRange::new(0.0, 1.0)),
            Parameter::derived("vs_initial_scan", vs_initial_scan)
                .native("vs_initial_scan", PackType::Bool)
                .boolean()
                .array_of(SCANS.len()),
            Parameter::derived("voltage_scan", voltage_scan)
                .native("Voltage_scan", PackType::Single)
                .number()
                .array_of(SCANS.len())
                .units("V"),
            Parameter::derived("scan_rate", scan_rate)
                .native("Scan_Rate", PackType::Single)
                .number()
                .array_of(SCANS.len())
                .units("mV/s")
                .range(DataRange::at_least(0.0)),
        ],
    )
});

pub(super) static RECORD: Lazy<RecordSchema> = Lazy::new(|| phased_record("LP"));

/// Rest phase fields, shared with CPP.
static REST_RECORD: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::extend(&TIME_SERIES, "polarization rest", &[Field::new("Ewe", "V")])
});

/// Scan phase fields, shared with CPP.
static SCAN_RECORD: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::extend(
        &TIME_SERIES,
        "polarization scan",
        &[
            Field::new("Ec", "V").optional(),
            Field::new("I_avg", "A"),
            Field::new("Ewe_avg", "V"),
        ],
    )
});

pub(super) static SPEC: TechniqueSpec = TechniqueSpec {
    id: TechId::Lp,
    description: "Linear Polarization",
    timebase: Timebase::Fixed(TIMEBASE),
    vmp3_program: Some("lp.ecc"),
    sp300_program: Some("lp4.ecc"),
    params: &PARAMS,
    record: &RECORD,
    unpack,
};

/// Rest phase sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LpRestData {
    pub time: f64,
    pub total_time: f64,
    #[serde(rename = "Ewe")]
    pub ewe: f64,
}

/// Scan phase sample, averaged over the measuring window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LpScanData {
    pub time: f64,
    pub total_time: f64,
    /// Control potential, VMP3 series only.
    #[serde(rename = "Ec", default, skip_serializing_if = "Option::is_none")]
    pub ec: Option<f64>,
    #[serde(rename = "I_avg")]
    pub i_avg: f64,
    #[serde(rename = "Ewe_avg")]
    pub ewe_avg: f64,
}

/// One LP record, tagged by the phase that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum LpData {
    Rest(LpRestData),
    Scan(LpScanData),
}

impl LpData {
    pub fn process_index(&self) -> u32 {
        match self {
            Self::Rest(_) => 0,
            Self::Scan(_) => 1,
        }
    }

    /// Field layout of `process_data` for the given phase.
    pub fn process_schema(process_index: u32) -> Option<&'static RecordSchema> {
        match process_index {
            0 => Some(&*REST_RECORD),
            1 => Some(&*SCAN_RECORD),
            _ => None,
        }
    }

    pub fn total_time(&self) -> f64 {
        match self {
            Self::Rest(d) => d.total_time,
            Self::Scan(d) => d.total_time,
        }
    }

    pub fn to_structured(&self) -> Value {
        match self {
            Self::Rest(d) => phase_to_structured(self.process_index(), d),
            Self::Scan(d) => phase_to_structured(self.process_index(), d),
        }
    }

    pub fn from_structured(value: &Value) -> DaqResult<Self> {
        Self::from_phase("LP", value)
    }

    pub(super) fn from_phase(technique: &str, value: &Value) -> DaqResult<Self> {
        match phase_from_structured(technique, value)? {
            (0, data) => Ok(Self::Rest(phase_record(technique, data)?)),
            (1, data) => Ok(Self::Scan(phase_record(technique, data)?)),
            (other, _) => Err(DaqError::conversion(
                format!("{technique} process_index"),
                format!("no process {other}"),
            )),
        }
    }
}

/// Unpacks a rest or scan frame of a two-phase polarization technique.
pub(super) fn unpack_phases(
    technique: &str,
    device: &DeviceInfo,
    frame: &RawFrame,
) -> DaqResult<Vec<LpData>> {
    match frame.process_index {
        0 => frame
            .rows()
            .map(|cells| {
                let row = Row::new(technique, cells, 3)?;
                let (time, total_time) = row.timestamps(frame);
                Ok(LpData::Rest(LpRestData { time, total_time, ewe: row.single(2) }))
            })
            .collect(),
        1 => {
            let vmp3 = device.family == DeviceFamily::Vmp3;
            let width = row_width(device, 5, 4);
            frame
                .rows()
                .map(|cells| {
                    let row = Row::new(technique, cells, width)?;
                    let (time, total_time) = row.timestamps(frame);
                    let base = if vmp3 { 3 } else { 2 };
                    Ok(LpData::Scan(LpScanData {
                        time,
                        total_time,
                        ec: vmp3.then(|| row.single(2)),
                        i_avg: row.single(base),
                        ewe_avg: row.single(base + 1),
                    }))
                })
                .collect()
        }
        _ => Err(unknown_process(technique, frame)),
    }
}

fn unpack(device: &DeviceInfo, frame: &RawFrame) -> DaqResult<Vec<TechniqueData>> {
    Ok(unpack_phases("LP", device, frame)?
        .into_iter()
        .map(TechniqueData::Lp)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::{data_frame, sp300_device, vmp3_device};
    use crate::device::ProgState;
    use crate::techniques::{Technique, TechniqueKind};
    use serde_json::json;

    fn lp() -> Technique {
        Technique::new(TechniqueKind::Lp)
            .with("record_every_dEr", 0.01)
            .unwrap()
            .with("rest_time_T", 10.0)
            .unwrap()
            .with("record_every_dTr", 0.5)
            .unwrap()
            .with("Ei", LpStep { voltage_scan: -0.025, scan_rate: 0.167, vs_initial_scan: true })
            .unwrap()
            .with("El", LpStep { voltage_scan: 0.025, scan_rate: 0.167, vs_initial_scan: true })
            .unwrap()
            .with("record_every_dE", 0.001)
            .unwrap()
            .with("average_over_dE", false)
            .unwrap()
            .with("begin_measuring_I", 0.5)
            .unwrap()
            .with("end_measuring_I", 1.0)
            .unwrap()
    }

    #[test]
    fn constants_are_packed() {
        let technique = lp();
        assert!(technique.validate(&vmp3_device()).is_empty());
        let packed = technique.pack(&vmp3_device()).unwrap();
        for id in ["OC1", "E1", "T1", "Scan_number"] {
            assert!(packed.iter().any(|p| p.id == id), "{id} not packed");
        }
        assert_eq!(packed.iter().filter(|p| p.id == "Voltage_scan").count(), 2);
    }

    #[test]
    fn missing_scan_vertex_is_required() {
        let technique = Technique::new(TechniqueKind::Lp);
        let errors = technique.validate(&vmp3_device());
        assert!(errors.iter().any(|e| e.param == "Ei" && e.message == "is required but has no value"));
    }

    #[test]
    fn rest_and_scan_phases_unpack() {
        let rows = [[0, 25_000, 0.3f32.to_bits()]];
        let frame = data_frame(ProgState::Run, 134, 0, TIMEBASE, 0.0, &rows);
        let records = lp().unpack(&vmp3_device(), &frame).unwrap();
        assert!(matches!(&records[0], TechniqueData::Lp(LpData::Rest(d)) if d.ewe == f64::from(0.3f32)));

        let rows = [[0, 25_000, 1e-6f32.to_bits(), 0.31f32.to_bits()]];
        let frame = data_frame(ProgState::Run, 134, 1, TIMEBASE, 10.0, &rows);
        let records = lp().unpack(&sp300_device(), &frame).unwrap();
        let TechniqueData::Lp(LpData::Scan(scan)) = &records[0] else { panic!("not a scan") };
        assert_eq!(scan.ec, None);
        assert!((scan.total_time - 11.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_process_is_a_frame_error() {
        let rows = [[0, 0, 0]];
        let frame = data_frame(ProgState::Run, 134, 2, TIMEBASE, 0.0, &rows);
        let err = lp().unpack(&vmp3_device(), &frame).unwrap_err();
        assert!(matches!(err, DaqError::RuntimeFrame(_)));
    }

    #[test]
    fn phases_are_tagged_in_structured_form() {
        let data = LpData::Rest(LpRestData { time: 1.0, total_time: 1.0, ewe: 0.2 });
        let value = data.to_structured();
        assert_eq!(
            value,
            json!({"process_index": 0, "process_data": {"time": 1.0, "total_time": 1.0, "Ewe": 0.2}})
        );
        assert_eq!(LpData::from_structured(&value).unwrap(), data);
        assert!(LpData::from_structured(&json!({"process_index": 5, "process_data": {}})).is_err());
        assert_eq!(RECORD.names().collect::<Vec<_>>(), ["process_index", "process_data"]);
        let rest: Vec<_> = LpData::process_schema(0).unwrap().names().collect();
        assert_eq!(rest, ["time", "total_time", "Ewe"]);
        assert!(LpData::process_schema(2).is_none());
    }
}
