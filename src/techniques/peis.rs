//! Potentio Electrochemical Impedance Spectroscopy.
//!
//! Applies a sine wave around a DC potential and measures the impedance over a
//! frequency sweep. Process 0 records the potential while the DC level settles;
//! process 1 records one impedance point per frequency.

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
    native_enum, DataRange, Field, PackType, ParamSchema, ParamValue, Parameter, RecordSchema,
    TechniqueParams,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const TIMEBASE: f64 = 24e-6;

native_enum! {
    /// Frequency spacing of the sweep.
    pub enum SweepMode as "SweepMode" {
        Logarithmic = 0 => "Logarithmic",
        Linear = 1 => "Linear",
    }
}

fn vs_final(params: &TechniqueParams) -> ParamValue {
    params.value("vs_initial")
}

fn final_voltage_step(params: &TechniqueParams) -> ParamValue {
    params.value("initial_voltage_step")
}

pub(super) static PARAMS: Lazy<ParamSchema> = Lazy::new(|| {
    ParamSchema::extend(
        &COMMON,
        "PEIS",
        vec![
            Parameter::stored("vs_initial")
                .native("vs_initial", PackType::Bool)
                .boolean(),
            Parameter::derived("vs_final", vs_final)
                .native("vs_final", PackType::Bool)
                .boolean(),
            Parameter::stored("initial_voltage_step")
                .native("Initial_Voltage_step", PackType::Single)
                .number()
                .units("V"),
            Parameter::derived("final_voltage_step", final_voltage_step)
                .native("Final_Voltage_step", PackType::Single)
                .number()
                .units("V"),
            Parameter::stored("duration_step")
                .native("Duration_step", PackType::Single)
                .number()
                .units("s")
                .range(duration_range(TIMEBASE)),
            Parameter::constant("step_number", 0i64).native("Step_number", PackType::Int),
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
            Parameter::stored("final_frequency")
                .native("Final_frequency", PackType::Single)
                .number()
                .units("Hz"),
            Parameter::stored("initial_frequency")
                .native("Initial_frequency", PackType::Single)
                .number()
                .units("Hz"),
            Parameter::stored("sweep")
                .native("sweep", PackType::Bool)
                .enumeration::<SweepMode>(),
            Parameter::stored("amplitude_voltage")
                .native("Amplitude_Voltage", PackType::Single)
                .number()
                .units("V"),
            Parameter::stored("frequency_number")
                .native("Frequency_number", PackType::Int)
                .integer()
                .range(DataRange::at_least(1.0)),
            Parameter::stored("average_n_times")
                .native("Average_N_times", PackType::Int)
                .integer()
                .range(DataRange::at_least(1.0)),
            Parameter::stored("correction")
                .native("Correction", PackType::Bool)
                .boolean(),
            Parameter::stored("wait_for_steady")
                .native("Wait_for_steady", PackType::Single)
                .number()
                .range(DataRange::at_least(0.0)),
        ],
    )
});

pub(super) static RECORD: Lazy<RecordSchema> = Lazy::new(|| phased_record("PEIS"));

static PROCESS0_RECORD: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::extend(
        &TIME_SERIES,
        "PEIS process 0",
        &[Field::new("Ewe", "V"), Field::new("I", "A")],
    )
});

static PROCESS1_RECORD: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::new(
        "PEIS process 1",
        &[
            Field::new("freq", "Hz"),
            Field::new("Ewe_mod", "V"),
            Field::new("I_mod", "A"),
            Field::new("phase_Zwe", "rad"),
            Field::new("Ewe", "V"),
            Field::new("I", "A"),
            Field::new("Ece_mod", "V"),
            Field::new("Ice_mod", "A"),
            Field::new("phase_Zce", "rad"),
            Field::new("Ece", "V"),
            Field::new("total_time", "s"),
            Field::unitless("I_range").optional(),
        ],
    )
});

pub(super) static SPEC: TechniqueSpec = TechniqueSpec {
    id: TechId::Peis,
    description: "Potentio Electrochemical Impedance Spectroscopy",
    timebase: Timebase::Fixed(TIMEBASE),
    vmp3_program: Some("peis.ecc"),
    sp300_program: Some("peis4.ecc"),
    params: &PARAMS,
    record: &RECORD,
    unpack,
};

/// Settling sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeisProcess0Data {
    pub time: f64,
    pub total_time: f64,
    #[serde(rename = "Ewe")]
    pub ewe: f64,
    #[serde(rename = "I")]
    pub i: f64,
}

/// One impedance point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeisProcess1Data {
    pub freq: f64,
    #[serde(rename = "Ewe_mod")]
    pub ewe_mod: f64,
    #[serde(rename = "I_mod")]
    pub i_mod: f64,
    #[serde(rename = "phase_Zwe")]
    pub phase_zwe: f64,
    #[serde(rename = "Ewe")]
    pub ewe: f64,
    #[serde(rename = "I")]
    pub i: f64,
    #[serde(rename = "Ece_mod")]
    pub ece_mod: f64,
    #[serde(rename = "Ice_mod")]
    pub ice_mod: f64,
    #[serde(rename = "phase_Zce")]
    pub phase_zce: f64,
    #[serde(rename = "Ece")]
    pub ece: f64,
    pub total_time: f64,
    /// Raw range cell as reported by VMP3 firmware. Units are undocumented.
    #[serde(rename = "I_range", default, skip_serializing_if = "Option::is_none")]
    pub i_range: Option<f64>,
}

/// One PEIS record, tagged by the process that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum PeisData {
    Process0(PeisProcess0Data),
    Process1(PeisProcess1Data),
}

impl PeisData {
    pub fn process_index(&self) -> u32 {
        match self {
            Self::Process0(_) => 0,
            Self::Process1(_) => 1,
        }
    }

    pub fn to_structured(&self) -> Value {
        match self {
            Self::Process0(d) => phase_to_structured(0, d),
            Self::Process1(d) => phase_to_structured(1, d),
        }
    }

    pub fn from_structured(value: &Value) -> DaqResult<Self> {
        match phase_from_structured("PEIS", value)? {
            (0, data) => Ok(Self::Process0(phase_record("PEIS", data)?)),
            (1, data) => Ok(Self::Process1(phase_record("PEIS", data)?)),
            (other, _) => Err(DaqError::conversion(
                "PEIS process_index",
                format!("no process {other}"),
            )),
        }
    }

    /// Field layout of the given process.
    pub fn process_schema(process_index: u32) -> Option<&'static RecordSchema> {
        match process_index {
            0 => Some(&*PROCESS0_RECORD),
            1 => Some(&*PROCESS1_RECORD),
            _ => None,
        }
    }
}

fn unpack(device: &DeviceInfo, frame: &RawFrame) -> DaqResult<Vec<TechniqueData>> {
    match frame.process_index {
        0 => frame
            .rows()
            .map(|cells| {
                let row = Row::new("PEIS", cells, 4)?;
                let (time, total_time) = row.timestamps(frame);
                Ok(TechniqueData::Peis(PeisData::Process0(PeisProcess0Data {
                    time,
                    total_time,
                    ewe: row.single(2),
                    i: row.single(3),
                })))
            })
            .collect(),
        1 => {
            let width = row_width(device, 15, 14);
            let vmp3 = device.family == DeviceFamily::Vmp3;
            frame
                .rows()
                .map(|cells| {
                    // No tick prefix: cells 6, 11 and 12 are unused.
                    let row = Row::new("PEIS", cells, width)?;
                    Ok(TechniqueData::Peis(PeisData::Process1(PeisProcess1Data {
                        freq: row.single(0),
                        ewe_mod: row.single(1),
                        i_mod: row.single(2),
                        phase_zwe: row.single(3),
                        ewe: row.single(4),
                        i: row.single(5),
                        ece_mod: row.single(7),
                        ice_mod: row.single(8),
                        phase_zce: row.single(9),
                        ece: row.single(10),
                        total_time: row.single(13),
                        i_range: vmp3.then(|| row.single(14)),
                    })))
                })
                .collect()
        }
        _ => Err(unknown_process("PEIS", frame)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::{data_frame, sp300_device, vmp3_device};
    use crate::device::ProgState;
    use crate::schema::NativeValue;
    use crate::techniques::{Technique, TechniqueKind};
    use serde_json::json;

    fn peis() -> Technique {
        Technique::new(TechniqueKind::Peis)
            .with("vs_initial", true)
            .unwrap()
            .with("initial_voltage_step", 0.0)
            .unwrap()
            .with("duration_step", 5.0)
            .unwrap()
            .with("record_every_dT", 0.5)
            .unwrap()
            .with("record_every_dI", 0.01)
            .unwrap()
            .with("final_frequency", 1.0)
            .unwrap()
            .with("initial_frequency", 100_000.0)
            .unwrap()
            .with("sweep", SweepMode::Logarithmic)
            .unwrap()
            .with("amplitude_voltage", 0.01)
            .unwrap()
            .with("frequency_number", 51i64)
            .unwrap()
            .with("average_n_times", 1i64)
            .unwrap()
            .with("correction", false)
            .unwrap()
            .with("wait_for_steady", 0.1)
            .unwrap()
    }

    #[test]
    fn final_values_mirror_initial() {
        let technique = peis();
        assert!(technique.validate(&vmp3_device()).is_empty());
        assert_eq!(technique.params().value("vs_final"), ParamValue::Bool(true));
        let packed = technique.pack(&vmp3_device()).unwrap();
        let sweep = packed.iter().find(|p| p.id == "sweep").unwrap();
        assert_eq!(sweep.value, NativeValue::Bool(false));
    }

    #[test]
    fn sweep_mode_serializes_by_name() {
        let value = peis().to_structured();
        assert_eq!(value["params"]["sweep"], "Logarithmic");
        let back = Technique::from_structured(&value).unwrap();
        assert_eq!(back.params().enum_value::<SweepMode>("sweep"), Some(SweepMode::Logarithmic));
    }

    #[test]
    fn frequency_count_must_be_positive() {
        let errors = peis().with("frequency_number", 0i64).unwrap().validate(&vmp3_device());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].param, "frequency_number");
    }

    #[test]
    fn impedance_rows_have_no_tick_prefix() {
        let mut cells = [0u32; 14];
        cells[0] = 1000.0f32.to_bits();
        cells[13] = 12.5f32.to_bits();
        let frame = data_frame(ProgState::Run, 104, 1, TIMEBASE, 0.0, &[cells]);
        let records = peis().unpack(&sp300_device(), &frame).unwrap();
        let TechniqueData::Peis(PeisData::Process1(point)) = &records[0] else { panic!("not process 1") };
        assert_eq!(point.freq, 1000.0);
        assert_eq!(point.total_time, 12.5);
        assert_eq!(point.i_range, None);
        assert_eq!(records[0].total_time(), Some(12.5));
        let value = serde_json::to_value(point).unwrap();
        assert_eq!(value["phase_Zwe"], json!(0.0));
        assert!(value.get("phase_zwe").is_none());
        assert!(value.get("I_range").is_none());

        let frame = data_frame(ProgState::Run, 104, 1, TIMEBASE, 0.0, &[cells]);
        assert!(peis().unpack(&vmp3_device(), &frame).is_err());
    }

    #[test]
    fn structured_form_carries_process_index() {
        let data = PeisData::Process0(PeisProcess0Data { time: 0.5, total_time: 1.5, ewe: 0.1, i: 0.0 });
        let value = data.to_structured();
        assert_eq!(value["process_index"], json!(0));
        assert_eq!(value["process_data"]["Ewe"], json!(0.1));
        assert_eq!(PeisData::from_structured(&value).unwrap(), data);
        assert_eq!(PeisData::process_schema(1).map(|s| s.fields().len()), Some(12));
    }
}
