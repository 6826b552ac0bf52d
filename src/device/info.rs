//! Instrument and channel information, plus the instrument's enumerations.
//!
//! Enumerations carry a numeric code (native form) and a symbolic name (structured
//! form). [`DeviceInfo`] and [`ChannelInfo`] serialize with those symbolic names.

use crate::schema::{native_enum, NativeEnum};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

native_enum! {
    /// Current range of a channel.
    pub enum IRange as "IRange" {
        Keep = -1 => "I_RANGE_KEEP",
        R100pA = 0 => "I_RANGE_100pA",
        R1nA = 1 => "I_RANGE_1nA",
        R10nA = 2 => "I_RANGE_10nA",
        R100nA = 3 => "I_RANGE_100nA",
        R1uA = 4 => "I_RANGE_1uA",
        R10uA = 5 => "I_RANGE_10uA",
        R100uA = 6 => "I_RANGE_100uA",
        R1mA = 7 => "I_RANGE_1mA",
        R10mA = 8 => "I_RANGE_10mA",
        R100mA = 9 => "I_RANGE_100mA",
        R1A = 10 => "I_RANGE_1A",
        Booster = 11 => "I_RANGE_BOOSTER",
        Auto = 12 => "I_RANGE_AUTO",
        R10pA = 13 => "I_RANGE_10pA",
        R1pA = 14 => "I_RANGE_1pA",
    }
}

impl IRange {
    /// Position on the magnitude scale; `None` for `KEEP` and `AUTO`, which are
    /// not bounded by channel limits.
    pub fn magnitude(self) -> Option<u8> {
        match self {
            Self::Keep | Self::Auto => None,
            Self::R1pA => Some(0),
            Self::R10pA => Some(1),
            Self::R100pA => Some(2),
            Self::R1nA => Some(3),
            Self::R10nA => Some(4),
            Self::R100nA => Some(5),
            Self::R1uA => Some(6),
            Self::R10uA => Some(7),
            Self::R100uA => Some(8),
            Self::R1mA => Some(9),
            Self::R10mA => Some(10),
            Self::R100mA => Some(11),
            Self::R1A => Some(12),
            Self::Booster => Some(13),
        }
    }
}

native_enum! {
    /// Potential range of a channel.
    pub enum ERange as "ERange" {
        R2V5 = 0 => "E_RANGE_2_5V",
        R5V = 1 => "E_RANGE_5V",
        R10V = 2 => "E_RANGE_10V",
        Auto = 3 => "E_RANGE_AUTO",
    }
}

native_enum! {
    /// Regulation bandwidth.
    pub enum Bandwidth as "Bandwidth" {
        Keep = -1 => "BW_KEEP",
        Bw1 = 1 => "BW_1",
        Bw2 = 2 => "BW_2",
        Bw3 = 3 => "BW_3",
        Bw4 = 4 => "BW_4",
        Bw5 = 5 => "BW_5",
        Bw6 = 6 => "BW_6",
        Bw7 = 7 => "BW_7",
        Bw8 = 8 => "BW_8",
        Bw9 = 9 => "BW_9",
    }
}

native_enum! {
    /// Program state reported by a channel.
    pub enum ProgState as "ProgState" {
        Stop = 0 => "STOP",
        Run = 1 => "RUN",
        Pause = 2 => "PAUSE",
    }
}

native_enum! {
    /// Firmware loaded on a channel.
    pub enum Firmware as "Firmware" {
        NoFirmware = 0 => "NONE",
        Interpreter = 1 => "INTERPR",
        Unknown = 4 => "UNKNOWN",
        Kernel = 5 => "KERNEL",
        Invalid = 8 => "INVALID",
        Ecal = 10 => "ECAL",
        Ecal4 = 11 => "ECAL4",
    }
}

native_enum! {
    /// Instrument model.
    pub enum DeviceModel as "DeviceModel" {
        Vmp = 0 => "VMP",
        Vmp2 = 1 => "VMP2",
        Mpg = 2 => "MPG",
        Bistat = 3 => "BISTAT",
        Mcs200 = 4 => "MCS_200",
        Vmp3 = 5 => "VMP3",
        Vsp = 6 => "VSP",
        Hcp803 = 7 => "HCP803",
        Epp400 = 8 => "EPP400",
        Epp4000 = 9 => "EPP4000",
        Bistat2 = 10 => "BISTAT2",
        Fct150s = 11 => "FCT150S",
        Vmp300 = 12 => "VMP300",
        Sp50 = 13 => "SP50",
        Sp150 = 14 => "SP150",
        Fct50s = 15 => "FCT50S",
        Sp300 = 16 => "SP300",
        Clb500 = 17 => "CLB500",
        Hcp1005 = 18 => "HCP1005",
        Clb2000 = 19 => "CLB2000",
        Vsp300 = 20 => "VSP300",
        Sp200 = 21 => "SP200",
        Mpg2 = 22 => "MPG2",
        Sp100 = 23 => "SP100",
        Mosled = 24 => "MOSLED",
        Kinexxx = 25 => "KINEXXX",
        Bcs815 = 26 => "BCS815",
        Sp240 = 27 => "SP240",
        Mpg205 = 28 => "MPG205",
        Mpg210 = 29 => "MPG210",
        Mpg220 = 30 => "MPG220",
        Mpg240 = 31 => "MPG240",
        Bp300 = 32 => "BP300",
        Vmp3e = 33 => "VMP3E",
        Vsp3e = 34 => "VSP3E",
        Sp50e = 35 => "SP50E",
        Sp150e = 36 => "SP150E",
        Unknown = 255 => "UNKNOWN",
    }
}

/// Instrument series. Techniques pick their program file and timebase by family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    #[serde(rename = "VMP3")]
    Vmp3,
    #[serde(rename = "SP300")]
    Sp300,
}

impl DeviceFamily {
    pub fn name(self) -> &'static str {
        match self {
            Self::Vmp3 => "VMP3",
            Self::Sp300 => "SP300",
        }
    }

    /// Kernel firmware loaded on channels of this family.
    pub fn kernel_file(self) -> &'static str {
        match self {
            Self::Vmp3 => "kernel.bin",
            Self::Sp300 => "kernel4.bin",
        }
    }

    /// FPGA image loaded alongside the kernel.
    pub fn fpga_file(self) -> &'static str {
        match self {
            Self::Vmp3 => "Vmp_ii_0437_a6.xlx",
            Self::Sp300 => "Vmp_iv_0395_aa.xlx",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl DeviceModel {
    /// Family of this model; `None` for models this crate cannot drive.
    pub fn family(self) -> Option<DeviceFamily> {
        use DeviceModel::*;
        match self {
            Vmp2 | Vmp3 | Bistat | Bistat2 | Mcs200 | Vsp | Sp50 | Sp150 | Fct50s | Fct150s
            | Clb500 | Clb2000 | Hcp803 | Hcp1005 | Mpg2 | Mpg205 | Mpg210 | Mpg220 | Mpg240
            | Bp300 | Vmp3e | Vsp3e | Sp50e | Sp150e => Some(DeviceFamily::Vmp3),
            Sp100 | Sp200 | Sp300 | Vsp300 | Vmp300 | Sp240 => Some(DeviceFamily::Sp300),
            Vmp | Mpg | Epp400 | Epp4000 | Mosled | Kinexxx | Bcs815 | Unknown => None,
        }
    }
}

const DATE_FORMAT: &str = "%Y/%m/%d";

mod firmware_date {
    use super::DATE_FORMAT;
    use chrono::NaiveDate;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format(DATE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveDate::parse_from_str(&text, DATE_FORMAT).map_err(de::Error::custom)
    }
}

/// Identity and capabilities of a connected instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: DeviceModel,
    pub family: DeviceFamily,
    /// RAM size in MB.
    pub ram_size: u32,
    pub cpu: u32,
    pub num_channels: u8,
    pub num_slots: u32,
    pub firmware_version: u32,
    #[serde(with = "firmware_date")]
    pub firmware_date: NaiveDate,
    pub ht_display_on: bool,
    pub num_connected_pc: u32,
}

fn plural(count: u64, label: &str) -> String {
    match count {
        1 => format!("1 {label}"),
        n => format!("{n} {label}s"),
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {}MB, CPU={}, {}, {}",
            self.model,
            self.ram_size,
            self.cpu,
            plural(u64::from(self.num_channels), "channel"),
            plural(u64::from(self.num_slots), "slot"),
        )?;
        writeln!(
            f,
            "Firmware: v{:.2} {}",
            f64::from(self.firmware_version) / 100.0,
            self.firmware_date.format(DATE_FORMAT),
        )?;
        write!(
            f,
            "{}, HTdisplay {}",
            plural(u64::from(self.num_connected_pc), "connection"),
            if self.ht_display_on { "on" } else { "off" },
        )
    }
}

/// Live status of one channel. Read on demand, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel number, starting at 1.
    pub channel: u8,
    pub board_version: u32,
    pub board_serial: u32,
    pub firmware: Firmware,
    pub firmware_version: u32,
    pub xilinx_version: u32,
    pub amplifier: u32,
    pub num_amplifiers: u32,
    pub lc_board: bool,
    pub z_board: bool,
    pub mux_board: bool,
    pub gpra_board: bool,
    pub mem_size: u32,
    pub mem_filled: u32,
    pub state: ProgState,
    #[serde(rename = "max_I_range")]
    pub max_i_range: Option<IRange>,
    #[serde(rename = "min_I_range")]
    pub min_i_range: Option<IRange>,
    pub max_bandwidth: Option<Bandwidth>,
    pub num_techniques: u32,
}

impl ChannelInfo {
    pub fn is_busy(&self) -> bool {
        self.state != ProgState::Stop
    }

    pub fn is_kernel_loaded(&self) -> bool {
        self.firmware == Firmware::Kernel
    }
}

fn range_name<E: NativeEnum>(value: Option<E>) -> &'static str {
    value.map_or("n/a", NativeEnum::name)
}

impl fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = f64::from(self.firmware_version);
        match self.firmware {
            Firmware::NoFirmware => {
                return write!(f, "board v{}, no firmware", self.board_version);
            }
            Firmware::Kernel => {
                writeln!(f, "Channel: {}", self.channel)?;
                writeln!(f, "board v{}, S/N {}", self.board_version, self.board_serial)?;
                writeln!(f, "{} LC head", if self.lc_board { "has a" } else { "no" })?;
                writeln!(f, "{} EIS capabilities", if self.z_board { "with" } else { "no" })?;
                writeln!(f, "{}", plural(u64::from(self.num_techniques), "technique"))?;
                writeln!(f, "State: {}", self.state)?;
                if self.num_amplifiers > 0 {
                    writeln!(f, "amplifier {} (x{})", self.amplifier, self.num_amplifiers)?;
                } else {
                    writeln!(f, "no amplifiers")?;
                }
                writeln!(
                    f,
                    "IRange: [{}, {}]",
                    range_name(self.min_i_range),
                    range_name(self.max_i_range)
                )?;
                writeln!(f, "MaxBandwidth: {}", range_name(self.max_bandwidth))?;
                if self.mem_size > 0 {
                    writeln!(
                        f,
                        "Memory: {:.1}KB ({:.2}% filled)",
                        f64::from(self.mem_size) / 1024.0,
                        f64::from(self.mem_filled) / f64::from(self.mem_size) * 100.0
                    )?;
                } else {
                    writeln!(f, "Memory: 0KB")?;
                }
                write!(f, "{} (v{:.3}), ", self.firmware, version / 1000.0)?;
            }
            _ => {
                write!(f, "{} (v{:.3}), ", self.firmware, version / 100.0)?;
            }
        }
        write!(f, "FPGA ({:04X})", self.xilinx_version)
    }
}
