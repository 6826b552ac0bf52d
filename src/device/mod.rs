//! Instrument model: identity and channel status, the driver interface, a simulated
//! driver and the connected [`Potentiostat`] handle.

mod driver;
mod info;
pub mod mock;
mod potentiostat;

pub use driver::{Driver, Instrument, RawFrame};
pub use info::{
    Bandwidth, ChannelInfo, DeviceFamily, DeviceInfo, DeviceModel, ERange, Firmware, IRange,
    ProgState,
};
pub use mock::{MockCall, MockConfig, MockDriver};
pub use potentiostat::{ConnectOptions, Potentiostat};

/// Fixtures shared by unit tests across the crate.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::techniques::{Technique, TechniqueKind};
    use chrono::NaiveDate;

    fn device(model: DeviceModel, family: DeviceFamily) -> DeviceInfo {
        DeviceInfo {
            model,
            family,
            ram_size: 64,
            cpu: 1,
            num_channels: 4,
            num_slots: 4,
            firmware_version: 600,
            firmware_date: NaiveDate::from_ymd_opt(2023, 6, 15).unwrap(),
            ht_display_on: false,
            num_connected_pc: 1,
        }
    }

    pub(crate) fn vmp3_device() -> DeviceInfo {
        device(DeviceModel::Sp150, DeviceFamily::Vmp3)
    }

    pub(crate) fn sp300_device() -> DeviceInfo {
        device(DeviceModel::Sp300, DeviceFamily::Sp300)
    }

    /// Stopped channel with kernel firmware and a 100pA..1A current range.
    pub(crate) fn vmp3_channel(channel: u8) -> ChannelInfo {
        ChannelInfo {
            channel,
            board_version: 3,
            board_serial: 1000 + u32::from(channel),
            firmware: Firmware::Kernel,
            firmware_version: 6040,
            xilinx_version: 0x0437,
            amplifier: 0,
            num_amplifiers: 0,
            lc_board: false,
            z_board: true,
            mux_board: false,
            gpra_board: false,
            mem_size: 4096,
            mem_filled: 0,
            state: ProgState::Stop,
            max_i_range: Some(IRange::R1A),
            min_i_range: Some(IRange::R100pA),
            max_bandwidth: Some(Bandwidth::Bw8),
            num_techniques: 0,
        }
    }

    /// Frame of `rows` produced by technique 0 with id `tech_id`.
    pub(crate) fn data_frame<const N: usize>(
        state: ProgState,
        tech_id: i32,
        process_index: u32,
        timebase: f64,
        start_time: f64,
        rows: &[[u32; N]],
    ) -> RawFrame {
        RawFrame {
            state,
            tech_index: 0,
            tech_id,
            process_index,
            start_time,
            timebase,
            rows: rows.len(),
            cols: N,
            data: rows.iter().flatten().copied().collect(),
        }
    }

    /// Valid OCV technique resting for `rest_time` seconds.
    pub(crate) fn ocv(rest_time: f64) -> Technique {
        Technique::new(TechniqueKind::Ocv)
            .with("rest_time_T", rest_time)
            .and_then(|t| t.with("record_every_dE", 0.01))
            .and_then(|t| t.with("record_every_dT", 0.5))
            .unwrap()
    }
}
