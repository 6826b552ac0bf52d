//! Instrument driver interface
//!
//! The vendor driver is an external collaborator. This module defines the small
//! capability surface the rest of the crate consumes, so the channel state machine,
//! the runner and the job server are written against traits instead of a vendor API:
//!
//! - [`Driver`] opens connections to an address
//! - [`Instrument`] is one open connection: channel status, firmware and technique
//!   loading, start/stop and data polling
//! - [`RawFrame`] is one batch of raw data returned by [`Instrument::poll_frame`]
//!
//! # Design Philosophy
//!
//! Each trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses [`DaqResult`] for errors
//!
//! Channel numbers start at 1 everywhere in this interface.
//!
//! # Example
//!
//! ```rust,ignore
//! let instrument = driver.connect("USB0", Duration::from_secs(5)).await?;
//! instrument.load_technique(1, "ocv.ecc", &params, true, true).await?;
//! instrument.start_channel(1).await?;
//! let frame = instrument.poll_frame(1).await?;
//! ```

use super::{DeviceInfo, ProgState};
use crate::error::DaqResult;
use crate::schema::NativeParam;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// One batch of raw data read from a channel.
///
/// Cells are raw 32-bit words. Depending on the column they hold an integer (time
/// counters, cycle numbers) or the bit pattern of an IEEE-754 single.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Channel state at the time of the read.
    pub state: ProgState,
    /// Index of the producing technique in the loaded sequence.
    pub tech_index: usize,
    /// Native id of the producing technique; 0 when no technique produced data.
    pub tech_id: i32,
    /// Phase of multi-phase techniques.
    pub process_index: u32,
    /// Start time of the technique in seconds.
    pub start_time: f64,
    /// Seconds per time counter tick.
    pub timebase: f64,
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<u32>,
}

impl RawFrame {
    /// Frame carrying no data, only the channel state.
    pub fn status(state: ProgState) -> Self {
        Self {
            state,
            tech_index: 0,
            tech_id: 0,
            process_index: 0,
            start_time: 0.0,
            timebase: 0.0,
            rows: 0,
            cols: 0,
            data: Vec::new(),
        }
    }

    /// True when the frame was produced by a technique.
    pub fn has_technique(&self) -> bool {
        self.tech_id != 0
    }

    /// Iterates over complete rows. A trailing partial row is ignored.
    pub fn rows(&self) -> impl Iterator<Item = &[u32]> + '_ {
        let count = if self.cols == 0 { 0 } else { self.rows };
        self.data.chunks_exact(self.cols.max(1)).take(count)
    }

    /// Seconds since the technique started, from the split tick counter.
    pub fn convert_time(&self, t_high: u32, t_low: u32) -> f64 {
        let ticks = (u64::from(t_high) << 32) + u64::from(t_low);
        self.timebase * ticks as f64
    }

    /// Single-precision value carried in a raw cell.
    pub fn single(raw: u32) -> f64 {
        f64::from(f32::from_bits(raw))
    }
}

/// Opens instrument connections.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Connect to the instrument at `address` (e.g. `USB0` or an IP address).
    ///
    /// # Returns
    /// - the open connection
    /// - `DaqError::Connection` if nothing answers at `address`
    async fn connect(&self, address: &str, timeout: Duration) -> DaqResult<Arc<dyn Instrument>>;
}

/// One open instrument connection.
///
/// # Contract
/// - `poll_frame` returns promptly with whatever data is available; a frame with no
///   technique identity only reports the channel state
/// - `stop_channel` on a stopped channel is harmless
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Identity and capabilities, read at connect time.
    fn device_info(&self) -> DeviceInfo;

    /// Version string of the vendor library.
    fn library_version(&self) -> String;

    async fn test_connection(&self) -> DaqResult<bool>;

    async fn channel_info(&self, channel: u8) -> DaqResult<super::ChannelInfo>;

    async fn is_plugged(&self, channel: u8) -> DaqResult<bool>;

    /// Load kernel and FPGA firmware on `channels`.
    async fn load_firmware(
        &self,
        channels: &[u8],
        kernel: &str,
        fpga: &str,
        force: bool,
    ) -> DaqResult<()>;

    /// Append one technique to the channel's sequence.
    ///
    /// `first` resets the sequence; `last` closes it.
    async fn load_technique(
        &self,
        channel: u8,
        program: &str,
        params: &[NativeParam],
        first: bool,
        last: bool,
    ) -> DaqResult<()>;

    async fn start_channel(&self, channel: u8) -> DaqResult<()>;

    async fn stop_channel(&self, channel: u8) -> DaqResult<()>;

    async fn poll_frame(&self, channel: u8) -> DaqResult<RawFrame>;

    /// Next pending log message of a channel, if any.
    async fn poll_message(&self, channel: u8) -> DaqResult<Option<String>>;

    async fn disconnect(&self) -> DaqResult<()>;
}
