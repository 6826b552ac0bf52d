//! Simulated potentiostat driver.
//!
//! [`MockDriver`] implements [`Driver`] without hardware. It keeps one shared state
//! for every connection it opens, so a test can hold a clone of the driver and
//! inspect what the code under test did:
//!
//! - every driver call is recorded as a [`MockCall`],
//! - frames can be scripted per channel, otherwise each loaded technique produces
//!   `frames_per_technique` frames of plausible rows for its layout,
//! - once a channel's frames are exhausted it reports `STOP`,
//! - channel limits, firmware, unplugged channels and failures are configurable.
//!
//! `serve --mock` runs the job server against this driver.

use super::{
    Bandwidth, ChannelInfo, DeviceFamily, DeviceInfo, DeviceModel, Driver, Firmware, IRange,
    Instrument, ProgState, RawFrame,
};
use crate::error::{DaqError, DaqResult};
use crate::schema::{NativeEnum, NativeParam};
use crate::techniques::TechniqueKind;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Configuration for [`MockDriver`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Simulated model; its family selects program files and row layouts.
    pub model: DeviceModel,
    pub num_channels: u8,
    /// Firmware reported by channels before any firmware load.
    pub firmware: Firmware,
    pub max_i_range: Option<IRange>,
    pub min_i_range: Option<IRange>,
    pub max_bandwidth: Option<Bandwidth>,
    /// Channels reporting as not plugged.
    pub unplugged: Vec<u8>,
    /// Real delay before each frame is returned.
    pub frame_delay_ms: u64,
    pub frames_per_technique: usize,
    pub rows_per_frame: usize,
    /// Simulated seconds between two rows.
    pub sample_interval_s: f64,
    /// Refuse every connection attempt.
    pub fail_connect: bool,
    /// Loading this program file fails.
    pub failing_program: Option<String>,
    pub library_version: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            model: DeviceModel::Vmp3,
            num_channels: 4,
            firmware: Firmware::Kernel,
            max_i_range: Some(IRange::R1A),
            min_i_range: Some(IRange::R100pA),
            max_bandwidth: Some(Bandwidth::Bw9),
            unplugged: Vec::new(),
            frame_delay_ms: 0,
            frames_per_technique: 5,
            rows_per_frame: 1,
            sample_interval_s: 1.0,
            fail_connect: false,
            failing_program: None,
            library_version: "6.04 (simulated)".to_string(),
        }
    }
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Connect { address: String },
    LoadFirmware { channels: Vec<u8>, force: bool },
    Load {
        channel: u8,
        program: String,
        params: Vec<NativeParam>,
        first: bool,
        last: bool,
    },
    Start { channel: u8 },
    Stop { channel: u8 },
    /// The channel ran out of frames and went back to `STOP` on its own.
    Finished { channel: u8 },
    Disconnect,
}

#[derive(Debug)]
struct ChannelSim {
    firmware: Firmware,
    state: ProgState,
    loaded: Vec<TechniqueKind>,
    queue: VecDeque<RawFrame>,
    scripted: Option<Vec<RawFrame>>,
    messages: VecDeque<String>,
    /// Starts since the channel last reported `STOP`.
    active_runs: usize,
    peak_runs: usize,
}

impl ChannelSim {
    fn settle(&mut self, state: ProgState) {
        self.state = state;
        if state == ProgState::Stop {
            self.active_runs = 0;
        }
    }
}

#[derive(Debug)]
struct MockState {
    channels: Vec<ChannelSim>,
    calls: Vec<MockCall>,
    open_connections: usize,
    fail_messages: bool,
}

impl MockState {
    fn channel(&mut self, channel: u8) -> DaqResult<&mut ChannelSim> {
        usize::from(channel)
            .checked_sub(1)
            .and_then(|idx| self.channels.get_mut(idx))
            .ok_or_else(|| DaqError::Instrument(format!("invalid channel number: {channel}")))
    }
}

/// Simulated driver. Clones share state.
#[derive(Clone)]
pub struct MockDriver {
    config: Arc<MockConfig>,
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new(config: MockConfig) -> Self {
        let channels = (0..config.num_channels)
            .map(|_| ChannelSim {
                firmware: config.firmware,
                state: ProgState::Stop,
                loaded: Vec::new(),
                queue: VecDeque::new(),
                scripted: None,
                messages: VecDeque::new(),
                active_runs: 0,
                peak_runs: 0,
            })
            .collect();
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(MockState {
                channels,
                calls: Vec::new(),
                open_connections: 0,
                fail_messages: false,
            })),
        }
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    /// Every call recorded so far, oldest first.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of technique load calls.
    pub fn load_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::Load { .. }))
            .count()
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    /// Frames the next start of `channel` replays instead of synthesized ones.
    pub fn script(&self, channel: u8, frames: Vec<RawFrame>) -> DaqResult<()> {
        self.state.lock().channel(channel)?.scripted = Some(frames);
        Ok(())
    }

    pub fn push_message(&self, channel: u8, message: impl Into<String>) -> DaqResult<()> {
        self.state.lock().channel(channel)?.messages.push_back(message.into());
        Ok(())
    }

    /// Forces the reported state, e.g. to simulate a channel busy with another program.
    pub fn set_state(&self, channel: u8, state: ProgState) -> DaqResult<()> {
        self.state.lock().channel(channel)?.settle(state);
        Ok(())
    }

    pub fn set_firmware(&self, channel: u8, firmware: Firmware) -> DaqResult<()> {
        self.state.lock().channel(channel)?.firmware = firmware;
        Ok(())
    }

    /// Largest number of runs `channel` ever had going at once.
    pub fn peak_runs(&self, channel: u8) -> DaqResult<usize> {
        Ok(self.state.lock().channel(channel)?.peak_runs)
    }

    /// Messages of `channel` not yet drained by a listener.
    pub fn pending_messages(&self, channel: u8) -> DaqResult<usize> {
        Ok(self.state.lock().channel(channel)?.messages.len())
    }

    /// Makes every message poll fail.
    pub fn fail_messages(&self, fail: bool) {
        self.state.lock().fail_messages = fail;
    }

    fn device_info(&self) -> DaqResult<DeviceInfo> {
        let family = self.config.model.family().ok_or_else(|| {
            DaqError::Connection(format!("unsupported device model: {}", self.config.model))
        })?;
        Ok(DeviceInfo {
            model: self.config.model,
            family,
            ram_size: 64,
            cpu: 1,
            num_channels: self.config.num_channels,
            num_slots: u32::from(self.config.num_channels),
            firmware_version: 604,
            firmware_date: NaiveDate::from_ymd_opt(2023, 6, 15).unwrap_or_default(),
            ht_display_on: false,
            num_connected_pc: 1,
        })
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new(MockConfig::default())
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self, address: &str, _timeout: Duration) -> DaqResult<Arc<dyn Instrument>> {
        if self.config.fail_connect {
            return Err(DaqError::Connection(format!("no instrument at {address}")));
        }
        let info = self.device_info()?;
        {
            let mut state = self.state.lock();
            state.calls.push(MockCall::Connect {
                address: address.to_string(),
            });
            state.open_connections += 1;
        }
        debug!(address, "Simulated instrument connected");
        Ok(Arc::new(MockInstrument {
            info,
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            connected: AtomicBool::new(true),
        }))
    }
}

struct MockInstrument {
    info: DeviceInfo,
    config: Arc<MockConfig>,
    state: Arc<Mutex<MockState>>,
    connected: AtomicBool,
}

impl MockInstrument {
    fn ensure_connected(&self) -> DaqResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DaqError::Connection("instrument is disconnected".to_string()))
        }
    }

    fn frames_for(&self, loaded: &[TechniqueKind]) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        let mut start_time = 0.0;
        for (tech_index, kind) in loaded.iter().enumerate() {
            let timebase = kind.spec().timebase.on(self.info.family);
            let rows = self.config.rows_per_frame.max(1);
            for frame_idx in 0..self.config.frames_per_technique {
                // Multi-phase techniques open with their rest phase.
                let process_index = match kind {
                    TechniqueKind::Peis | TechniqueKind::Lp | TechniqueKind::Cpp
                        if frame_idx > 0 =>
                    {
                        1
                    }
                    _ => 0,
                };
                let mut data = Vec::new();
                for row in 0..rows {
                    let n = frame_idx * rows + row;
                    let time = (n + 1) as f64 * self.config.sample_interval_s;
                    data.extend(sample_row(
                        *kind,
                        self.info.family,
                        process_index,
                        timebase,
                        time,
                        start_time + time,
                        n as u32,
                    ));
                }
                let cols = data.len() / rows;
                frames.push(RawFrame {
                    state: ProgState::Run,
                    tech_index,
                    tech_id: kind.id().code(),
                    process_index,
                    start_time,
                    timebase,
                    rows,
                    cols,
                    data,
                });
            }
            start_time +=
                (self.config.frames_per_technique * rows) as f64 * self.config.sample_interval_s;
        }
        frames
    }
}

fn single(value: f64) -> u32 {
    (value as f32).to_bits()
}

/// One raw row in the layout `kind` uses on `family`.
pub(crate) fn sample_row(
    kind: TechniqueKind,
    family: DeviceFamily,
    process_index: u32,
    timebase: f64,
    time: f64,
    total_time: f64,
    n: u32,
) -> Vec<u32> {
    let ticks = (time / timebase).round() as u64;
    let (t_high, t_low) = ((ticks >> 32) as u32, ticks as u32);
    let vmp3 = family == DeviceFamily::Vmp3;
    let ewe = 0.1 + 0.001 * f64::from(n);
    let current = 1e-6 * f64::from(n + 1);
    match (kind, process_index) {
        (TechniqueKind::Ocv, _) if vmp3 => vec![t_high, t_low, single(ewe)],
        (TechniqueKind::Ocv, _) => vec![t_high, t_low, single(ewe), single(0.0)],
        (TechniqueKind::Ca | TechniqueKind::Cp, _) => {
            vec![t_high, t_low, single(ewe), single(current), 0]
        }
        (TechniqueKind::Cv, _) if vmp3 => {
            vec![t_high, t_low, single(ewe), single(current), single(ewe), 0]
        }
        (TechniqueKind::Cv, _) => vec![t_high, t_low, single(current), single(ewe), 0],
        (TechniqueKind::Lp | TechniqueKind::Cpp, 0) => vec![t_high, t_low, single(ewe)],
        (TechniqueKind::Lp | TechniqueKind::Cpp, _) if vmp3 => {
            vec![t_high, t_low, single(ewe), single(current), single(ewe)]
        }
        (TechniqueKind::Lp | TechniqueKind::Cpp, _) => {
            vec![t_high, t_low, single(current), single(ewe)]
        }
        (TechniqueKind::Peis, 0) => vec![t_high, t_low, single(ewe), single(current)],
        (TechniqueKind::Peis | TechniqueKind::Pzir, _) => {
            let freq = 1e5 / f64::from(n + 1);
            let mut row = vec![
                single(freq),
                single(0.01),
                single(current),
                single(0.0),
                single(ewe),
                single(current),
                0,
                single(0.0),
                single(0.0),
                single(0.0),
                single(0.0),
                0,
            ];
            match (kind, vmp3) {
                (TechniqueKind::Peis, true) => {
                    row.extend([0, single(total_time), single(f64::from(IRange::R1mA.code()))]);
                }
                (TechniqueKind::Peis, false) => row.extend([0, single(total_time)]),
                (_, true) => row.extend([0, single(total_time), IRange::R1mA.code().unsigned_abs()]),
                (_, false) => row.push(single(total_time)),
            }
            row
        }
    }
}

#[async_trait]
impl Instrument for MockInstrument {
    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn library_version(&self) -> String {
        self.config.library_version.clone()
    }

    async fn test_connection(&self) -> DaqResult<bool> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn channel_info(&self, channel: u8) -> DaqResult<ChannelInfo> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        let sim = state.channel(channel)?;
        Ok(ChannelInfo {
            channel,
            board_version: 3,
            board_serial: 1000 + u32::from(channel),
            firmware: sim.firmware,
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
            state: sim.state,
            max_i_range: self.config.max_i_range,
            min_i_range: self.config.min_i_range,
            max_bandwidth: self.config.max_bandwidth,
            num_techniques: sim.loaded.len() as u32,
        })
    }

    async fn is_plugged(&self, channel: u8) -> DaqResult<bool> {
        self.ensure_connected()?;
        self.state.lock().channel(channel)?;
        Ok(!self.config.unplugged.contains(&channel))
    }

    async fn load_firmware(
        &self,
        channels: &[u8],
        _kernel: &str,
        _fpga: &str,
        force: bool,
    ) -> DaqResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        for &channel in channels {
            state.channel(channel)?.firmware = Firmware::Kernel;
        }
        state.calls.push(MockCall::LoadFirmware {
            channels: channels.to_vec(),
            force,
        });
        Ok(())
    }

    async fn load_technique(
        &self,
        channel: u8,
        program: &str,
        params: &[NativeParam],
        first: bool,
        last: bool,
    ) -> DaqResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        state.calls.push(MockCall::Load {
            channel,
            program: program.to_string(),
            params: params.to_vec(),
            first,
            last,
        });
        if self.config.failing_program.as_deref() == Some(program) {
            return Err(DaqError::Instrument(format!("failed to load {program}")));
        }
        let kind = TechniqueKind::from_program(program)
            .ok_or_else(|| DaqError::Instrument(format!("unknown program file: {program}")))?;
        let sim = state.channel(channel)?;
        if sim.state != ProgState::Stop {
            return Err(DaqError::Instrument(format!("channel {channel} is running")));
        }
        if first {
            sim.loaded.clear();
        }
        sim.loaded.push(kind);
        Ok(())
    }

    async fn start_channel(&self, channel: u8) -> DaqResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        state.calls.push(MockCall::Start { channel });
        let sim = state.channel(channel)?;
        if sim.loaded.is_empty() {
            return Err(DaqError::Instrument(format!("no technique loaded on channel {channel}")));
        }
        let frames = match sim.scripted.take() {
            Some(frames) => frames,
            None => self.frames_for(&sim.loaded),
        };
        sim.queue = frames.into();
        sim.state = ProgState::Run;
        sim.active_runs += 1;
        sim.peak_runs = sim.peak_runs.max(sim.active_runs);
        Ok(())
    }

    async fn stop_channel(&self, channel: u8) -> DaqResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        state.calls.push(MockCall::Stop { channel });
        let sim = state.channel(channel)?;
        sim.queue.clear();
        sim.settle(ProgState::Stop);
        Ok(())
    }

    async fn poll_frame(&self, channel: u8) -> DaqResult<RawFrame> {
        if self.config.frame_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.frame_delay_ms)).await;
        }
        self.ensure_connected()?;
        let mut state = self.state.lock();
        let sim = state.channel(channel)?;
        match sim.queue.pop_front() {
            Some(frame) => {
                sim.settle(frame.state);
                Ok(frame)
            }
            None => {
                let finished = sim.state != ProgState::Stop;
                sim.settle(ProgState::Stop);
                if finished {
                    state.calls.push(MockCall::Finished { channel });
                }
                Ok(RawFrame::status(ProgState::Stop))
            }
        }
    }

    async fn poll_message(&self, channel: u8) -> DaqResult<Option<String>> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if state.fail_messages {
            return Err(DaqError::Instrument("message queue unavailable".to_string()));
        }
        Ok(state.channel(channel)?.messages.pop_front())
    }

    async fn disconnect(&self) -> DaqResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut state = self.state.lock();
            state.calls.push(MockCall::Disconnect);
            state.open_connections = state.open_connections.saturating_sub(1);
        }
        Ok(())
    }
}
