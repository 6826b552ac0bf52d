//! Pieces shared by every technique: the hardware-wide parameters, the time-series
//! record fields and raw row access.

use crate::device::{Bandwidth, DeviceFamily, DeviceInfo, ERange, IRange, RawFrame};
use crate::error::{DaqError, DaqResult};
use crate::schema::{DataRange, Field, PackType, ParamSchema, Parameter, RecordSchema};
use once_cell::sync::Lazy;

/// Largest tick count a technique duration may span.
pub(super) const MAX_TICKS: f64 = 2_147_483_648.0;

/// `[0..timebase * 2^31]`, the longest duration the instrument can time.
pub(super) fn duration_range(timebase: f64) -> DataRange {
    DataRange::new(0.0, timebase * MAX_TICKS)
}

/// Parameters every technique accepts.
pub(super) static COMMON: Lazy<ParamSchema> = Lazy::new(|| {
    ParamSchema::new(
        "Technique",
        vec![
            Parameter::stored("E_range")
                .native("E_Range", PackType::Int)
                .enumeration::<ERange>()
                .default(ERange::Auto),
            Parameter::stored("I_range")
                .native("I_Range", PackType::Int)
                .enumeration::<IRange>()
                .default(IRange::Auto),
            Parameter::stored("bandwidth")
                .native("Bandwidth", PackType::Int)
                .enumeration::<Bandwidth>()
                .default(Bandwidth::Keep),
        ],
    )
});

/// Fields of records stamped with the technique clock.
pub(super) static TIME_SERIES: Lazy<RecordSchema> = Lazy::new(|| {
    RecordSchema::new(
        "TimeSeries",
        &[Field::new("time", "s"), Field::new("total_time", "s")],
    )
});

/// Top-level fields of multi-phase records: `{process_index, process_data}`.
/// The layout of `process_data` is described per phase.
pub(super) fn phased_record(name: &'static str) -> RecordSchema {
    RecordSchema::new(
        name,
        &[Field::unitless("process_index"), Field::unitless("process_data")],
    )
}

/// One raw data row with bounds-checked cell access.
pub(super) struct Row<'a> {
    cells: &'a [u32],
}

impl<'a> Row<'a> {
    /// Checks that the row holds at least `expected` cells. Trailing cells are ignored.
    pub(super) fn new(technique: &str, cells: &'a [u32], expected: usize) -> DaqResult<Self> {
        if cells.len() < expected {
            return Err(DaqError::RuntimeFrame(format!(
                "{technique} row has {} cells, expected at least {expected}",
                cells.len()
            )));
        }
        Ok(Self { cells })
    }

    pub(super) fn raw(&self, idx: usize) -> u32 {
        self.cells.get(idx).copied().unwrap_or_default()
    }

    pub(super) fn single(&self, idx: usize) -> f64 {
        RawFrame::single(self.raw(idx))
    }

    /// `(time, total_time)` from the tick counter in the first two cells.
    pub(super) fn timestamps(&self, frame: &RawFrame) -> (f64, f64) {
        let time = frame.convert_time(self.raw(0), self.raw(1));
        (time, time + frame.start_time)
    }
}

/// Cell count of a row, picked by device family.
pub(super) fn row_width(device: &DeviceInfo, vmp3: usize, sp300: usize) -> usize {
    match device.family {
        DeviceFamily::Vmp3 => vmp3,
        DeviceFamily::Sp300 => sp300,
    }
}

pub(super) fn unknown_process(technique: &str, frame: &RawFrame) -> DaqError {
    DaqError::RuntimeFrame(format!(
        "{technique} has no process {}",
        frame.process_index
    ))
}
