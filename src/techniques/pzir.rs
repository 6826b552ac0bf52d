//! IR Determination with Potentiostatic Impedance.
//!
//! Measures the solution resistance as the real part of the impedance at a single
//! high frequency. A percentage of it (`rcomp_level`) compensates the following
//! potentio techniques.

use super::common::{row_width, Row, COMMON};
use super::{TechId, TechniqueData, TechniqueSpec, Timebase};
use crate::device::{DeviceFamily, DeviceInfo, IRange, RawFrame};
use crate::error::{DaqError, DaqResult};
use crate::schema::{
    native_enum, DataRange, Field, NativeEnum, PackType, ParamSchema, ParamValue, Parameter,
    RecordSchema, TechniqueParams,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

const TIMEBASE: f64 = 24e-6;

native_enum! {
    /// Compensation mode applied to the following techniques.
    pub enum RcmpMode as "RcmpMode" {
        Software = 0 => "Software",
        Hardware = 1 => "Hardware",
    }
}

fn frequency(params: &TechniqueParams) -> ParamValue {
    params.value("frequency")
}

fn is_sp300(device: &DeviceInfo) -> bool {
    device.family == DeviceFamily::Sp300
}

pub(super) static PARAMS: Lazy<ParamSchema> = Lazy::new(|| {
    ParamSchema::extend(
        &COMMON,
        "PZIR",
        vec![
            Parameter::stored("frequency").number().units("Hz"),
            // The firmware takes a sweep; both ends sit on the single frequency.
            Parameter::derived("final_frequency", frequency)
                .native("Final_frequency", PackType::Single)
                .number()
                .units("Hz"),
            Parameter::derived("initial_frequency", frequency)
                .native("Initial_frequency", PackType::Single)
                .number()
                .units("Hz"),
            Parameter::stored("amplitude_voltage")
                .native("Amplitude_Voltage", PackType::Single)
                .number()
                .units("V"),
            Parameter::stored("average_n_times")
                .native("Average_N_times", PackType::Int)
                .integer()
                .range(DataRange::at_least(1.0)),
            Parameter::stored("wait_for_steady")
                .native("Wait_for_steady", PackType::Single)
                .number()
                .range(DataRange::at_least(0.0)),
            Parameter::constant("sweep", true).native("sweep", PackType::Bool),
            Parameter::stored("rcomp_level")
                .native("Rcomp_Level", PackType::Single)
                .number()
                .units("%IR")
                .range(DataRange::at_least(0.0)),
            Parameter::stored("rcmp_mode")
                .native("Rcmp_Mode", PackType::Int)
                .enumeration::<RcmpMode>()
                .default(RcmpMode::Software)
                .only_on(is_sp300),
        ],
    )
});

pub(super) static RECORD: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::new(
        "PZIR",
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
            Field::unitless("t"),
            Field::unitless("I_range").optional(),
        ],
    )
});

pub(super) static SPEC: TechniqueSpec = TechniqueSpec {
    id: TechId::Pzir,
    description: "IR Determination with Potentiostatic Impedance",
    timebase: Timebase::Fixed(TIMEBASE),
    vmp3_program: Some("pzir.ecc"),
    sp300_program: Some("pzir4.ecc"),
    params: &PARAMS,
    record: &RECORD,
    unpack,
};

/// One impedance point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PzirData {
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
    /// Reported as-is; the firmware does not document it.
    pub t: f64,
    /// Current range in use, VMP3 series only.
    #[serde(rename = "I_range", default, skip_serializing_if = "Option::is_none")]
    pub i_range: Option<IRange>,
}

fn unpack(device: &DeviceInfo, frame: &RawFrame) -> DaqResult<Vec<TechniqueData>> {
    let width = row_width(device, 15, 13);
    let vmp3 = device.family == DeviceFamily::Vmp3;
    frame
        .rows()
        .map(|cells| {
            let row = Row::new("PZIR", cells, width)?;
            let i_range = if vmp3 {
                let raw = row.raw(14);
                let range = i32::try_from(raw)
                    .ok()
                    .and_then(IRange::from_code)
                    .ok_or_else(|| {
                        DaqError::RuntimeFrame(format!("PZIR row has invalid I_range code {raw}"))
                    })?;
                Some(range)
            } else {
                None
            };
            // 6 and 11 are unused; 12 too on VMP3.
            let t = if vmp3 { row.single(13) } else { row.single(12) };
            Ok(TechniqueData::Pzir(PzirData {
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
                t,
                i_range,
            }))
        })
        .collect()
}
