//! Open Circuit Voltage.
//!
//! No potential or current is applied: the cell is disconnected from the power
//! amplifier and only the rest potential is recorded.

use super::common::{duration_range, Row, COMMON, TIME_SERIES};
use super::{TechId, TechniqueData, TechniqueSpec, Timebase};
use crate::device::{DeviceFamily, DeviceInfo, RawFrame};
use crate::error::DaqResult;
use crate::schema::{DataRange, Field, PackType, ParamSchema, Parameter, RecordSchema};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

const TIMEBASE: f64 = 20e-6;

pub(super) static PARAMS: Lazy<ParamSchema> = Lazy::new(|| {
    ParamSchema::extend(
        &COMMON,
        "OCV",
        vec![
            Parameter::stored("rest_time_T")
                .native("Rest_time_T", PackType::Single)
                .number()
                .units("s")
                .range(duration_range(TIMEBASE)),
            Parameter::stored("record_every_dE")
                .native("Record_every_dE", PackType::Single)
                .number()
                .units("V")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("record_every_dT")
                .native("Record_every_dT", PackType::Single)
                .number()
                .units("s")
                .range(DataRange::at_least(0.0)),
        ],
    )
});

pub(super) static RECORD: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::extend(
        &TIME_SERIES,
        "OCV",
        &[Field::new("Ewe", "V"), Field::new("Ece", "V").optional()],
    )
});

pub(super) static SPEC: TechniqueSpec = TechniqueSpec {
    id: TechId::Ocv,
    description: "Open Circuit Voltage",
    timebase: Timebase::Fixed(TIMEBASE),
    vmp3_program: Some("ocv.ecc"),
    sp300_program: Some("ocv4.ecc"),
    params: &PARAMS,
    record: &RECORD,
    unpack,
};

/// One OCV sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcvData {
    pub time: f64,
    pub total_time: f64,
    #[serde(rename = "Ewe")]
    pub ewe: f64,
    /// Counter electrode potential, SP-300 series only.
    #[serde(rename = "Ece", default, skip_serializing_if = "Option::is_none")]
    pub ece: Option<f64>,
}

fn unpack(device: &DeviceInfo, frame: &RawFrame) -> DaqResult<Vec<TechniqueData>> {
    let sp300 = device.family == DeviceFamily::Sp300;
    let width = if sp300 { 4 } else { 3 };
    frame
        .rows()
        .map(|cells| {
            let row = Row::new("OCV", cells, width)?;
            let (time, total_time) = row.timestamps(frame);
            Ok(TechniqueData::Ocv(OcvData {
                time,
                total_time,
                ewe: row.single(2),
                ece: sp300.then(|| row.single(3)),
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

    fn ocv() -> Technique {
        Technique::new(TechniqueKind::Ocv)
            .with("rest_time_T", 60.0)
            .unwrap()
            .with("record_every_dE", 0.01)
            .unwrap()
            .with("record_every_dT", 0.5)
            .unwrap()
    }

    #[test]
    fn valid_parameters_pass() {
        assert!(ocv().validate(&vmp3_device()).is_empty());
    }

    #[test]
    fn negative_record_interval_is_named() {
        let technique = ocv().with("record_every_dT", -1.0).unwrap();
        let errors = technique.validate(&vmp3_device());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].param, "record_every_dT");
        assert_eq!(errors[0].message, "value not in range: >= 0");
    }

    #[test]
    fn rest_time_is_bounded_by_clock() {
        let technique = ocv().with("rest_time_T", 50_000.0).unwrap();
        let errors = technique.validate(&vmp3_device());
        assert_eq!(errors[0].param, "rest_time_T");
    }

    #[test]
    fn pack_lists_common_then_own_parameters() {
        let ids: Vec<_> = ocv()
            .pack(&vmp3_device())
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(
            ids,
            ["E_Range", "I_Range", "Bandwidth", "Rest_time_T", "Record_every_dE", "Record_every_dT"]
        );
    }

    #[test]
    fn unpack_reads_ece_on_sp300_only() {
        let rows = [[0, 50_000, 0.25f32.to_bits(), 0.5f32.to_bits()]];
        let frame = data_frame(ProgState::Run, 100, 0, TIMEBASE, 2.0, &rows);
        let records = ocv().unpack(&sp300_device(), &frame).unwrap();
        let TechniqueData::Ocv(data) = &records[0] else { panic!("not OCV") };
        assert!((data.time - 1.0).abs() < 1e-9);
        assert!((data.total_time - 3.0).abs() < 1e-9);
        assert_eq!(data.ewe, 0.25);
        assert_eq!(data.ece, Some(0.5));

        let rows = [[0, 50_000, 0.25f32.to_bits()]];
        let frame = data_frame(ProgState::Run, 100, 0, TIMEBASE, 0.0, &rows);
        let records = ocv().unpack(&vmp3_device(), &frame).unwrap();
        assert_eq!(
            records[0].to_structured(),
            json!({"time": records[0].total_time().unwrap(), "total_time": records[0].total_time().unwrap(), "Ewe": 0.25})
        );
    }

    #[test]
    fn extra_trailing_cells_are_ignored() {
        let rows = [[0, 50_000, 0.25f32.to_bits(), 0.5f32.to_bits(), 9]];
        let frame = data_frame(ProgState::Run, 100, 0, TIMEBASE, 0.0, &rows);
        let records = ocv().unpack(&vmp3_device(), &frame).unwrap();
        let TechniqueData::Ocv(data) = &records[0] else { panic!("not OCV") };
        assert_eq!(data.ewe, 0.25);
        assert_eq!(data.ece, None);
    }

    #[test]
    fn short_rows_are_frame_errors() {
        let rows = [[0, 1]];
        let frame = data_frame(ProgState::Run, 100, 0, TIMEBASE, 0.0, &rows);
        assert!(ocv().unpack(&vmp3_device(), &frame).is_err());
    }

    #[test]
    fn record_fields_match_structured_keys() {
        let data = OcvData { time: 0.0, total_time: 0.0, ewe: 0.0, ece: Some(0.0) };
        let value = serde_json::to_value(&data).unwrap();
        for name in RECORD.names() {
            assert!(value.get(name).is_some(), "missing {name}");
        }
    }
}
