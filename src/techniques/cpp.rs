//! Cyclic Potentiodynamic Polarization.
//!
//! Evaluates pitting susceptibility. After a rest phase the potential is swept up
//! until either the limit potential or the pitting current `I_pitting` is reached,
//! held, then swept back. Records share the LP phase layout.

use super::common::{duration_range, phased_record, COMMON};
use super::lp::{unpack_phases, LpData, LpRestData, LpScanData};
use super::{TechId, TechniqueData, TechniqueSpec, Timebase};
use crate::device::{DeviceInfo, RawFrame};
use crate::error::DaqResult;
use crate::schema::{DataRange, PackType, ParamSchema, Parameter, RecordSchema};
use once_cell::sync::Lazy;

const TIMEBASE: Timebase = Timebase::PerFamily {
    vmp3: 40e-6,
    sp300: 44e-6,
};

/// Number of scan segments.
const SCANS: usize = 3;

pub type CppData = LpData;
pub type CppRestData = LpRestData;
pub type CppScanData = LpScanData;

pub(super) static PARAMS: Lazy<ParamSchema> = Lazy::new(|| {
    ParamSchema::extend(
        &COMMON,
        "CPP",
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
                .range_for(|device| duration_range(TIMEBASE.on(device.family))),
            Parameter::stored("record_every_dTr")
                .native("Record_every_dTr", PackType::Single)
                .number()
                .units("s")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("vs_initial_scan")
                .native("vs_initial_scan", PackType::Bool)
                .boolean()
                .array_of(SCANS),
            Parameter::stored("voltage_scan")
                .native("Voltage_scan", PackType::Single)
                .number()
                .array_of(SCANS)
                .units("V"),
            Parameter::stored("scan_rate")
                .native("Scan_Rate", PackType::Single)
                .number()
                .array_of(SCANS)
                .units("V/s")
                .range(DataRange::at_least(0.0)),
            Parameter::constant("scan_number", 1i64).native("Scan_number", PackType::Int),
            Parameter::stored("I_pitting")
                .native("I_pitting", PackType::Single)
                .number()
                .units("A")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("t_b")
                .native("t_b", PackType::Single)
                .number()
                .units("s")
                .range(DataRange::at_least(0.0)),
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
            Parameter::stored("record_every_dT")
                .native("Record_every_dT", PackType::Single)
                .number()
                .units("s")
                .range(DataRange::at_least(0.0)),
        ],
    )
});

pub(super) static RECORD: Lazy<RecordSchema> = Lazy::new(|| phased_record("CPP"));

pub(super) static SPEC: TechniqueSpec = TechniqueSpec {
    id: TechId::Cpp,
    description: "Cyclic Potentiodynamic Polarization",
    timebase: TIMEBASE,
    vmp3_program: Some("cpp.ecc"),
    sp300_program: Some("cpp4.ecc"),
    params: &PARAMS,
    record: &RECORD,
    unpack,
};

fn unpack(device: &DeviceInfo, frame: &RawFrame) -> DaqResult<Vec<TechniqueData>> {
    Ok(unpack_phases("CPP", device, frame)?
        .into_iter()
        .map(TechniqueData::Cpp)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::{data_frame, vmp3_device};
    use crate::device::ProgState;
    use crate::schema::ParamValue;
    use crate::techniques::{Technique, TechniqueKind};

    fn cpp() -> Technique {
        Technique::new(TechniqueKind::Cpp)
            .with("record_every_dEr", 0.01)
            .unwrap()
            .with("rest_time_T", 30.0)
            .unwrap()
            .with("record_every_dTr", 0.5)
            .unwrap()
            .with("vs_initial_scan", vec![true, false, true])
            .unwrap()
            .with("voltage_scan", vec![-0.1, 1.0, 0.0])
            .unwrap()
            .with("scan_rate", vec![0.001, 0.001, 0.001])
            .unwrap()
            .with("I_pitting", 1e-3)
            .unwrap()
            .with("t_b", 10.0)
            .unwrap()
            .with("record_every_dE", 0.001)
            .unwrap()
            .with("average_over_dE", true)
            .unwrap()
            .with("begin_measuring_I", 0.5)
            .unwrap()
            .with("end_measuring_I", 1.0)
            .unwrap()
            .with("record_every_dT", 0.1)
            .unwrap()
    }

    #[test]
    fn scan_arrays_need_three_entries() {
        assert!(cpp().validate(&vmp3_device()).is_empty());
        let errors = cpp()
            .with("voltage_scan", vec![0.0, 1.0])
            .unwrap()
            .validate(&vmp3_device());
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "value must contain exactly 3 elements but 2 were given"
        );
    }

    #[test]
    fn scan_array_elements_are_type_checked() {
        let errors = cpp()
            .with("vs_initial_scan", vec![ParamValue::Bool(true), ParamValue::Float(1.0), ParamValue::Bool(false)])
            .unwrap()
            .validate(&vmp3_device());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].param, "vs_initial_scan[1]");
        assert!(errors[0].message.starts_with("incorrect type"));
    }

    #[test]
    fn scan_phase_on_vmp3_carries_ec() {
        let rows = [[0, 0, 0.5f32.to_bits(), 1e-6f32.to_bits(), 0.49f32.to_bits()]];
        let frame = data_frame(ProgState::Run, 136, 1, 40e-6, 0.0, &rows);
        let records = cpp().unpack(&vmp3_device(), &frame).unwrap();
        let TechniqueData::Cpp(LpData::Scan(scan)) = &records[0] else { panic!("not a scan") };
        assert_eq!(scan.ec, Some(f64::from(0.5f32)));
        assert_eq!(scan.ewe_avg, f64::from(0.49f32));
    }
}
