//! Chrono-Amperometry.
//!
//! Steps the working electrode potential through a list of levels and records the
//! current response over time.

use super::common::{duration_range, Row, COMMON, TIME_SERIES};
use super::{TechId, TechniqueData, TechniqueSpec, Timebase};
use crate::device::{DeviceInfo, RawFrame};
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
    vmp3: 24e-6,
    sp300: 21e-6,
};

/// One potential step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaStep {
    /// Potential in V.
    pub voltage: f64,
    /// Duration in s.
    pub duration: f64,
    /// Potential is relative to the initial potential.
    pub vs_initial: bool,
}

impl From<CaStep> for ParamValue {
    fn from(step: CaStep) -> Self {
        ParamValue::Record(BTreeMap::from([
            ("voltage".to_string(), ParamValue::Float(step.voltage)),
            ("duration".to_string(), ParamValue::Float(step.duration)),
            ("vs_initial".to_string(), ParamValue::Bool(step.vs_initial)),
        ]))
    }
}

fn parse_steps(value: &Value) -> Result<ParamValue, String> {
    let steps: Vec<CaStep> = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    Ok(ParamValue::from(steps))
}

/// `len(steps) - 1`, as the instrument expects.
pub(super) fn step_number(params: &TechniqueParams) -> ParamValue {
    let count = params.value("steps").as_list().map_or(0, <[ParamValue]>::len);
    ParamValue::Int(count as i64 - 1)
}

fn voltage_step(params: &TechniqueParams) -> ParamValue {
    params.list_field("steps", "voltage")
}

pub(super) fn duration_step(params: &TechniqueParams) -> ParamValue {
    params.list_field("steps", "duration")
}

pub(super) fn vs_initial(params: &TechniqueParams) -> ParamValue {
    params.list_field("steps", "vs_initial")
}

pub(super) static PARAMS: Lazy<ParamSchema> = Lazy::new(|| {
    ParamSchema::extend(
        &COMMON,
        "CA",
        vec![
            Parameter::stored("record_every_dT")
                .native("Record_every_dT", PackType::Single)
                .number()
                .units("s")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("record_every_dI")
                .native("Record_every_dI", PackType::Single)
                .number()
                .units("A")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("n_cycles")
                .native("N_Cycles", PackType::Int)
                .integer()
                .range(DataRange::at_least(0.0)),
            Parameter::stored("steps").array().from_structured(parse_steps),
            Parameter::derived("voltage_step", voltage_step)
                .native("Voltage_step", PackType::Single)
                .number()
                .array()
                .units("V"),
            Parameter::derived("vs_initial", vs_initial)
                .native("vs_initial", PackType::Bool)
                .boolean()
                .array(),
            Parameter::derived("duration_step", duration_step)
                .native("Duration_step", PackType::Single)
                .number()
                .array()
                .units("s")
                .range_for(|device| duration_range(TIMEBASE.on(device.family))),
            Parameter::derived("step_number", step_number)
                .native("Step_number", PackType::Int)
                .integer()
                .range(DataRange::new(0.0, 98.0)),
        ],
    )
});

pub(super) static RECORD: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::extend(
        &TIME_SERIES,
        "CA",
        &[
            Field::new("Ewe", "V"),
            Field::new("I", "A"),
            Field::unitless("cycle"),
        ],
    )
});

pub(super) static SPEC: TechniqueSpec = TechniqueSpec {
    id: TechId::Ca,
    description: "Chrono-Amperometry",
    timebase: TIMEBASE,
    vmp3_program: Some("ca.ecc"),
    sp300_program: Some("ca4.ecc"),
    params: &PARAMS,
    record: &RECORD,
    unpack,
};

/// One CA sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaData {
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
            let row = Row::new("CA", cells, 5)?;
            let (time, total_time) = row.timestamps(frame);
            Ok(TechniqueData::Ca(CaData {
                time,
                total_time,
                ewe: row.single(2),
                i: row.single(3),
                cycle: row.raw(4),
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::{data_frame, sp300_device, vmp3_device};
    use crate::device::ProgState;
    use crate::techniques::{Technique, TechniqueKind};
    use serde_json::json;

    fn ca(steps: Vec<CaStep>) -> Technique {
        Technique::new(TechniqueKind::Ca)
            .with("record_every_dT", 0.1)
            .unwrap()
            .with("record_every_dI", 0.001)
            .unwrap()
            .with("n_cycles", 0i64)
            .unwrap()
            .with("steps", steps)
            .unwrap()
    }

    fn step(voltage: f64, duration: f64) -> CaStep {
        CaStep { voltage, duration, vs_initial: false }
    }

    #[test]
    fn derived_arrays_follow_steps() {
        let technique = ca(vec![step(0.1, 10.0), step(0.2, 20.0), step(0.3, 30.0)]);
        let params = technique.params();
        assert_eq!(params.value("voltage_step"), ParamValue::from(vec![0.1, 0.2, 0.3]));
        assert_eq!(params.value("duration_step"), ParamValue::from(vec![10.0, 20.0, 30.0]));
        assert_eq!(params.value("vs_initial"), ParamValue::from(vec![false, false, false]));
        assert_eq!(params.value("step_number"), ParamValue::Int(2));
        assert!(technique.validate(&vmp3_device()).is_empty());
    }

    #[test]
    fn empty_step_list_is_invalid() {
        let errors = ca(Vec::new()).validate(&vmp3_device());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].param, "step_number");
    }

    #[test]
    fn duration_limit_depends_on_family() {
        // 24e-6 * 2^31 ~ 51540 s on VMP3, 21e-6 * 2^31 ~ 45097 s on SP300
        let technique = ca(vec![step(0.1, 50_000.0)]);
        assert!(technique.validate(&vmp3_device()).is_empty());
        let errors = technique.validate(&sp300_device());
        assert_eq!(errors[0].param, "duration_step[0]");
    }

    #[test]
    fn derived_values_cannot_be_set() {
        let err = ca(vec![step(0.1, 1.0)]).with("voltage_step", vec![1.0]).unwrap_err();
        assert!(matches!(err, crate::DaqError::ReadOnlyParameter(_)));
    }

    #[test]
    fn steps_pack_one_entry_per_index() {
        let packed = ca(vec![step(0.1, 10.0), step(0.2, 20.0)])
            .pack(&vmp3_device())
            .unwrap();
        let voltages: Vec<_> = packed.iter().filter(|p| p.id == "Voltage_step").map(|p| p.index).collect();
        assert_eq!(voltages, [0, 1]);
        assert!(packed.iter().any(|p| p.id == "Step_number"));
    }

    #[test]
    fn structured_round_trip_keeps_derived_values() {
        let technique = ca(vec![step(0.1, 10.0), CaStep { voltage: -0.2, duration: 5.0, vs_initial: true }]);
        let value = technique.to_structured();
        assert_eq!(
            value["params"]["steps"],
            json!([
                {"voltage": 0.1, "duration": 10.0, "vs_initial": false},
                {"voltage": -0.2, "duration": 5.0, "vs_initial": true}
            ])
        );
        let back = Technique::from_structured(&value).unwrap();
        assert_eq!(back, technique);
        assert_eq!(back.params().value("voltage_step"), technique.params().value("voltage_step"));
    }

    #[test]
    fn malformed_steps_name_the_field() {
        let err = Technique::from_structured(&json!({
            "tech_id": "CA",
            "params": {"record_every_dT": 0.1, "record_every_dI": 0.1, "n_cycles": 0, "steps": [{"voltage": 1}]}
        }))
        .unwrap_err();
        assert!(matches!(err, crate::DaqError::Conversion { ref field, .. } if field == "steps"));
    }

    #[test]
    fn unpack_reads_cycle_as_integer() {
        let rows = [[0, 24_000, 0.5f32.to_bits(), 1e-3f32.to_bits(), 3]];
        let frame = data_frame(ProgState::Run, 101, 0, 24e-6, 0.0, &rows);
        let records = ca(vec![step(0.1, 1.0)]).unpack(&vmp3_device(), &frame).unwrap();
        let TechniqueData::Ca(data) = &records[0] else { panic!("not CA") };
        assert_eq!(data.cycle, 3);
        assert_eq!(data.ewe, 0.5);
        assert!((data.time - 0.576).abs() < 1e-9);
    }
}
