//! Channel state machine.
//!
//! A [`Channel`] owns one hardware channel of a connected instrument. It turns a
//! technique list into a running program and hands back a [`TechniqueRunner`] that
//! pulls the program's data:
//!
//! ```text
//!   Stopped ── run_techniques ──► Running ⇄ Paused
//!      ▲                             │
//!      └──── stop / program end ─────┘
//! ```
//!
//! Run and stop transitions are serialized by a per-channel async mutex. Each run
//! owns a [`CancellationToken`]; stopping the channel cancels it so a consumer blocked
//! in [`TechniqueRunner::next`] wakes up with [`DaqError::ChannelCancelled`].
//!
//! Every plugged channel also runs a message listener task that forwards the
//! instrument's log messages to `tracing`.

use crate::device::{ChannelInfo, DeviceInfo, IRange, Instrument, ProgState, RawFrame};
use crate::error::{DaqError, DaqResult, TechniqueValidationError};
use crate::runner::TechniqueRunner;
use crate::schema::NativeEnum;
use crate::techniques::Technique;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The listener gives up after this many consecutive failed polls.
const MAX_LISTENER_FAILURES: u32 = 10;

/// Timing of the message listener.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Pause between two reads of the instrument message queue.
    pub message_poll_interval: Duration,
    /// How long [`Channel::stop_listener`] waits before aborting the task.
    pub listener_join_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            message_poll_interval: Duration::from_secs(1),
            listener_join_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct ActiveRun {
    runner_id: u64,
    token: CancellationToken,
}

struct Listener {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// One hardware channel.
pub struct Channel {
    instrument: Arc<dyn Instrument>,
    number: u8,
    device: DeviceInfo,
    library_version: String,
    options: ChannelOptions,
    active: Mutex<Option<ActiveRun>>,
    next_runner_id: AtomicU64,
    listener: SyncMutex<Option<Listener>>,
}

impl Channel {
    /// Wraps channel `number` of an open instrument. Nothing is sent to the
    /// instrument until a run or the listener is started.
    pub fn new(
        instrument: Arc<dyn Instrument>,
        number: u8,
        device: DeviceInfo,
        library_version: String,
        options: ChannelOptions,
    ) -> Self {
        Self {
            instrument,
            number,
            device,
            library_version,
            options,
            active: Mutex::new(None),
            next_runner_id: AtomicU64::new(1),
            listener: SyncMutex::new(None),
        }
    }

    /// Channel number, counted from 1.
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Identity of the instrument the channel belongs to.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    /// Version string of the instrument library, as read at connect time.
    pub fn library_version(&self) -> &str {
        &self.library_version
    }

    /// Live channel status, read from the instrument.
    pub async fn info(&self) -> DaqResult<ChannelInfo> {
        self.instrument.channel_info(self.number).await
    }

    /// Whether a channel board sits in this slot.
    pub async fn is_plugged(&self) -> DaqResult<bool> {
        self.instrument.is_plugged(self.number).await
    }

    /// True when the instrument reports a program on this channel.
    pub async fn is_busy(&self) -> DaqResult<bool> {
        Ok(self.info().await?.is_busy())
    }

    /// Loads `techniques` as one sequence, starts it and returns the runner that
    /// pulls its data.
    ///
    /// # Errors
    /// - `Precondition` when the list is empty, the channel is not plugged, busy, has
    ///   no kernel firmware, or a technique does not exist on this device family
    /// - `Validation` with every parameter error of every technique
    /// - `HardwareLimit` when a current range or bandwidth exceeds the channel limits
    /// - any driver error raised while loading or starting; the channel is stopped
    ///   again before it is returned
    pub async fn run_techniques(
        self: &Arc<Self>,
        techniques: Vec<Technique>,
    ) -> DaqResult<TechniqueRunner> {
        let channel = self.number;
        if techniques.is_empty() {
            return Err(DaqError::Precondition(format!(
                "no techniques to run on channel {channel}"
            )));
        }
        if !self.is_plugged().await? {
            return Err(DaqError::Precondition(format!(
                "channel {channel} is not plugged"
            )));
        }

        let mut active = self.active.lock().await;
        let status = self.info().await?;
        if status.is_busy() {
            return Err(DaqError::Precondition(format!(
                "channel {channel} is busy ({})",
                status.state
            )));
        }
        if let Some(unsupported) = techniques.iter().find(|t| !t.is_device_supported(&self.device))
        {
            return Err(DaqError::Precondition(format!(
                "{} is not supported on {} devices",
                unsupported.kind(),
                self.device.family
            )));
        }
        if !status.is_kernel_loaded() {
            return Err(DaqError::Precondition(format!(
                "kernel firmware is not loaded on channel {channel} ({})",
                status.firmware
            )));
        }

        let errors: Vec<TechniqueValidationError> = techniques
            .iter()
            .enumerate()
            .flat_map(|(tech_index, technique)| {
                technique
                    .validate(&self.device)
                    .into_iter()
                    .map(move |error| TechniqueValidationError { tech_index, error })
            })
            .collect();
        if !errors.is_empty() {
            return Err(DaqError::Validation(errors));
        }
        check_limits(&techniques, &status)?;

        if let Err(e) = self.load_and_start(&techniques).await {
            warn!(channel, error = %e, "Failed to start techniques, stopping channel");
            if let Err(stop_err) = self.instrument.stop_channel(channel).await {
                error!(channel, error = %stop_err, "Failed to stop channel after load error");
            }
            return Err(e);
        }

        if let Some(previous) = active.take() {
            previous.token.cancel();
        }
        let runner_id = self.next_runner_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        *active = Some(ActiveRun {
            runner_id,
            token: token.clone(),
        });
        let names: Vec<&str> = techniques.iter().map(|t| t.kind().name()).collect();
        info!(channel, runner_id, techniques = ?names, "Techniques started");

        let source = FrameSource {
            instrument: Arc::clone(&self.instrument),
            channel,
            token,
        };
        Ok(TechniqueRunner::new(Arc::clone(self), runner_id, techniques, source))
    }

    async fn load_and_start(&self, techniques: &[Technique]) -> DaqResult<()> {
        let last_index = techniques.len() - 1;
        for (idx, technique) in techniques.iter().enumerate() {
            let program = technique.program_file(&self.device)?;
            let params = technique.pack(&self.device)?;
            debug!(channel = self.number, program, params = params.len(), "Loading technique");
            self.instrument
                .load_technique(self.number, program, &params, idx == 0, idx == last_index)
                .await?;
        }
        self.instrument.start_channel(self.number).await
    }

    /// Stops whatever runs on the channel.
    ///
    /// Does nothing when the instrument already reports `STOP`. Otherwise the active
    /// run is cancelled before the hardware stop is issued.
    pub async fn stop(&self) -> DaqResult<()> {
        let mut active = self.active.lock().await;
        if !self.info().await?.is_busy() {
            return Ok(());
        }
        self.stop_locked(&mut active).await
    }

    /// Stops the channel only while the run `runner_id` is the registered one and
    /// the instrument still reports it running or paused.
    pub(crate) async fn stop_runner(&self, runner_id: u64) -> DaqResult<()> {
        let mut active = self.active.lock().await;
        if active.as_ref().map(|run| run.runner_id) != Some(runner_id) {
            return Ok(());
        }
        if !self.info().await?.is_busy() {
            return Ok(());
        }
        self.stop_locked(&mut active).await
    }

    async fn stop_locked(&self, active: &mut Option<ActiveRun>) -> DaqResult<()> {
        if let Some(run) = active.take() {
            debug!(channel = self.number, runner_id = run.runner_id, "Cancelling active run");
            run.token.cancel();
        }
        self.instrument.stop_channel(self.number).await?;
        info!(channel = self.number, "Channel stopped");
        Ok(())
    }

    /// True while `runner_id` is registered and the channel reports `RUN`.
    pub async fn is_active(&self, runner_id: u64) -> bool {
        let active = self.active.lock().await;
        if active.as_ref().map(|run| run.runner_id) != Some(runner_id) {
            return false;
        }
        matches!(self.info().await, Ok(status) if status.state == ProgState::Run)
    }

    /// Spawns the message listener unless one is already running.
    pub fn start_listener(&self) {
        let mut slot = self.listener.lock();
        if slot.as_ref().is_some_and(|l| !l.handle.is_finished()) {
            return;
        }
        let stop = CancellationToken::new();
        let handle = tokio::spawn(listen(
            Arc::clone(&self.instrument),
            self.number,
            self.options.message_poll_interval,
            stop.clone(),
        ));
        *slot = Some(Listener { stop, handle });
    }

    /// Signals the listener to stop and waits for it, at most the join timeout.
    pub async fn stop_listener(&self) {
        let Some(Listener { stop, mut handle }) = self.listener.lock().take() else {
            return;
        };
        stop.cancel();
        if tokio::time::timeout(self.options.listener_join_timeout, &mut handle)
            .await
            .is_err()
        {
            warn!(
                channel = self.number,
                timeout = ?self.options.listener_join_timeout,
                "Message listener did not stop in time, aborting it"
            );
            handle.abort();
        }
    }

    /// True while the message listener task is alive.
    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|l| !l.handle.is_finished())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.stop.cancel();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number)
            .field("family", &self.device.family)
            .finish_non_exhaustive()
    }
}

fn check_limits(techniques: &[Technique], status: &ChannelInfo) -> DaqResult<()> {
    let max = status.max_i_range.and_then(IRange::magnitude);
    let min = status.min_i_range.and_then(IRange::magnitude);
    if let (Some(max), Some(min)) = (max, min) {
        if max < min {
            return Err(DaqError::HardwareLimit(format!(
                "invalid I_range limits on channel {}",
                status.channel
            )));
        }
    }

    for (idx, technique) in techniques.iter().enumerate() {
        if let Some(range) = technique.i_range() {
            if let Some(magnitude) = range.magnitude() {
                if max.is_some_and(|max| magnitude > max) {
                    return Err(DaqError::HardwareLimit(format!(
                        "technique {idx} ({}): I_range {range} is above the channel maximum {}",
                        technique.kind(),
                        status.max_i_range.map_or("n/a", NativeEnum::name),
                    )));
                }
                if min.is_some_and(|min| magnitude < min) {
                    return Err(DaqError::HardwareLimit(format!(
                        "technique {idx} ({}): I_range {range} is below the channel minimum {}",
                        technique.kind(),
                        status.min_i_range.map_or("n/a", NativeEnum::name),
                    )));
                }
            }
        }
        if let (Some(bandwidth), Some(max_bandwidth)) = (technique.bandwidth(), status.max_bandwidth)
        {
            if bandwidth.code() > max_bandwidth.code() {
                return Err(DaqError::HardwareLimit(format!(
                    "technique {idx} ({}): bandwidth {bandwidth} is above the channel maximum {max_bandwidth}",
                    technique.kind(),
                )));
            }
        }
    }
    Ok(())
}

/// Raw frames of one run. Polls race against the run's cancellation token.
pub(crate) struct FrameSource {
    instrument: Arc<dyn Instrument>,
    channel: u8,
    token: CancellationToken,
}

impl FrameSource {
    pub(crate) async fn next(&self) -> DaqResult<RawFrame> {
        if self.token.is_cancelled() {
            return Err(DaqError::ChannelCancelled(self.channel));
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(DaqError::ChannelCancelled(self.channel)),
            frame = self.instrument.poll_frame(self.channel) => frame,
        }
    }
}

async fn listen(
    instrument: Arc<dyn Instrument>,
    channel: u8,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut failures = 0u32;
    debug!(channel, "Message listener started");
    loop {
        loop {
            match instrument.poll_message(channel).await {
                Ok(Some(message)) => {
                    failures = 0;
                    info!(channel, "{}", message.trim_end());
                }
                Ok(None) => {
                    failures = 0;
                    break;
                }
                Err(e) => {
                    failures += 1;
                    warn!(channel, failures, error = %e, "Failed to read channel messages");
                    break;
                }
            }
        }
        if failures >= MAX_LISTENER_FAILURES {
            error!(channel, "Message listener giving up after repeated failures");
            return;
        }
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(channel, "Message listener stopped");
}
