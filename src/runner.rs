//! Technique runner.
//!
//! A [`TechniqueRunner`] is the pull side of one run started by
//! [`Channel::run_techniques`]. Each call to [`TechniqueRunner::next`] reads raw frames
//! until it has something to report:
//!
//! - a record, tagged with the index of the technique that produced it,
//! - [`RunnerItem::Paused`] while the channel is paused,
//! - [`RunnerItem::DataWait`] when the instrument had nothing new, so the consumer
//!   can poll less often,
//! - `None` once the channel reports `STOP`,
//! - an error, after which the runner is finished.
//!
//! The runner is single-pass: it cannot be restarted once it has ended.
//!
//! [`Channel::run_techniques`]: crate::channel::Channel::run_techniques

use crate::channel::{Channel, FrameSource};
use crate::device::{ProgState, RawFrame};
use crate::error::{DaqError, DaqResult};
use crate::metadata::TechniqueMetadata;
use crate::schema::NativeEnum;
use crate::techniques::{TechId, Technique, TechniqueData};
use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    /// No frame read yet.
    Init,
    /// Last frame reported `RUN`.
    Running,
    Paused,
    /// The channel reported `STOP` after the sequence.
    Complete,
    /// Another actor stopped the channel.
    Cancelled,
    /// A frame could not be read or unpacked.
    Error,
    /// Never produced by a runner; accepted when reading stored metadata.
    Unknown,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Complete => "COMPLETE",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record with the position of its technique in the run.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedData {
    /// Position in the loaded sequence, from 0.
    pub tech_index: usize,
    pub tech_id: TechId,
    pub data: TechniqueData,
}

/// One step of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerItem {
    Data(IndexedData),
    Paused,
    DataWait,
}

/// Pulls the data of one run.
pub struct TechniqueRunner {
    channel: Arc<Channel>,
    runner_id: u64,
    techniques: Vec<Technique>,
    source: FrameSource,
    pending: VecDeque<IndexedData>,
    last_state: Option<ProgState>,
    error: Option<DaqError>,
    finished: bool,
    start_time: DateTime<FixedOffset>,
    stop_time: Option<DateTime<FixedOffset>>,
}

impl TechniqueRunner {
    pub(crate) fn new(
        channel: Arc<Channel>,
        runner_id: u64,
        techniques: Vec<Technique>,
        source: FrameSource,
    ) -> Self {
        Self {
            channel,
            runner_id,
            techniques,
            source,
            pending: VecDeque::new(),
            last_state: None,
            error: None,
            finished: false,
            start_time: Local::now().fixed_offset(),
            stop_time: None,
        }
    }

    /// Next step of the run; `None` once the run ended.
    pub async fn next(&mut self) -> Option<DaqResult<RunnerItem>> {
        loop {
            if let Some(data) = self.pending.pop_front() {
                return Some(Ok(RunnerItem::Data(data)));
            }
            if self.finished {
                return None;
            }

            let frame = match self.source.next().await {
                Ok(frame) => frame,
                Err(e) => return Some(Err(self.fail(e).await)),
            };
            self.last_state = Some(frame.state);

            if frame.has_technique() {
                match self.unpack(&frame) {
                    Ok(records) => self.pending.extend(records),
                    Err(e) => return Some(Err(self.fail(e).await)),
                }
                continue;
            }
            match frame.state {
                ProgState::Stop => {
                    debug!(channel = self.channel.number(), "Run complete");
                    self.finish();
                    return None;
                }
                ProgState::Pause => return Some(Ok(RunnerItem::Paused)),
                ProgState::Run => return Some(Ok(RunnerItem::DataWait)),
            }
        }
    }

    /// Records of a technique frame. Frames that do not match the loaded sequence
    /// are logged and dropped.
    fn unpack(&self, frame: &RawFrame) -> DaqResult<Vec<IndexedData>> {
        let tech_index = frame.tech_index;
        let Some(technique) = self.techniques.get(tech_index) else {
            warn!(
                channel = self.channel.number(),
                tech_index, "Frame references an invalid technique index"
            );
            return Ok(Vec::new());
        };
        let tech_id = technique.id();
        if frame.tech_id != tech_id.code() {
            warn!(
                channel = self.channel.number(),
                tech_index,
                frame_id = frame.tech_id,
                expected = tech_id.code(),
                "Technique id mismatch"
            );
            return Ok(Vec::new());
        }
        let records = technique.unpack(self.channel.device_info(), frame)?;
        Ok(records
            .into_iter()
            .map(|data| IndexedData {
                tech_index,
                tech_id,
                data,
            })
            .collect())
    }

    async fn fail(&mut self, error: DaqError) -> DaqError {
        if error.is_cancellation() {
            debug!(channel = self.channel.number(), "Run cancelled");
        } else {
            warn!(channel = self.channel.number(), error = %error, "Run failed, stopping channel");
            if let Err(stop_err) = self.channel.stop_runner(self.runner_id).await {
                warn!(channel = self.channel.number(), error = %stop_err, "Failed to stop channel");
            }
        }
        self.error = Some(error.clone());
        self.finish();
        error
    }

    fn finish(&mut self) {
        self.finished = true;
        self.stop_time = Some(Local::now().fixed_offset());
    }

    pub fn state(&self) -> RunState {
        if let Some(error) = &self.error {
            return if error.is_cancellation() {
                RunState::Cancelled
            } else {
                RunState::Error
            };
        }
        match self.last_state {
            None => RunState::Init,
            Some(ProgState::Run) => RunState::Running,
            Some(ProgState::Pause) => RunState::Paused,
            Some(ProgState::Stop) => RunState::Complete,
        }
    }

    /// The error that ended the run, if any.
    pub fn error(&self) -> Option<&DaqError> {
        self.error.as_ref()
    }

    pub fn techniques(&self) -> &[Technique] {
        &self.techniques
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn start_time(&self) -> DateTime<FixedOffset> {
        self.start_time
    }

    pub fn stop_time(&self) -> Option<DateTime<FixedOffset>> {
        self.stop_time
    }

    /// True while this run is the channel's active one and the channel is running.
    pub async fn is_active(&self) -> bool {
        self.channel.is_active(self.runner_id).await
    }

    /// Stops the channel if this run is still the active one.
    pub async fn stop(&self) -> DaqResult<()> {
        self.channel.stop_runner(self.runner_id).await
    }

    /// Pulls the run to its end, handing every record to `on_record`.
    ///
    /// Once `interrupt` is cancelled the channel is stopped and the runner keeps
    /// being pulled until it ends, so records already read from the instrument are
    /// still delivered. A pull in progress is never dropped. `data_wait` paces the
    /// polling while the instrument has nothing new.
    pub async fn drain<E, F>(
        &mut self,
        interrupt: &CancellationToken,
        data_wait: Duration,
        mut on_record: F,
    ) -> Result<(), E>
    where
        E: From<DaqError>,
        F: FnMut(IndexedData) -> Result<(), E>,
    {
        let mut stopping = false;
        loop {
            if !stopping && interrupt.is_cancelled() {
                stopping = true;
                debug!(channel = self.channel.number(), "Interrupted, stopping run");
                self.stop().await?;
            }
            match self.next().await {
                Some(Ok(RunnerItem::Data(data))) => on_record(data)?,
                Some(Ok(RunnerItem::Paused | RunnerItem::DataWait)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(data_wait) => {}
                        _ = interrupt.cancelled(), if !stopping => {}
                    }
                }
                Some(Err(e)) if e.is_cancellation() => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }

    /// Snapshot of the run, reading the channel status now.
    pub async fn metadata(&self) -> DaqResult<TechniqueMetadata> {
        Ok(TechniqueMetadata {
            library_version: self.channel.library_version().to_string(),
            device_info: self.channel.device_info().clone(),
            channel_info: self.channel.info().await?,
            channel: self.channel.number(),
            start_time: Some(self.start_time),
            stop_time: self.stop_time,
            status: self.state(),
        })
    }
}

impl fmt::Debug for TechniqueRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TechniqueRunner")
            .field("channel", &self.channel.number())
            .field("runner_id", &self.runner_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOptions;
    use crate::device::test_support::{data_frame, ocv};
    use crate::device::{Driver, MockCall, MockConfig, MockDriver};
    use std::time::Duration;

    async fn channel_on(driver: &MockDriver) -> Arc<Channel> {
        let instrument = driver.connect("USB0", Duration::from_secs(1)).await.unwrap();
        let device = instrument.device_info();
        Arc::new(Channel::new(
            instrument,
            1,
            device,
            "6.04".to_string(),
            ChannelOptions::default(),
        ))
    }

    fn ocv_frame(tech_index: usize, tech_id: i32, state: ProgState) -> RawFrame {
        RawFrame {
            tech_index,
            ..data_frame(state, tech_id, 0, 20e-6, 0.0, &[[0, 50_000, 0.25f32.to_bits()]])
        }
    }

    async fn collect(runner: &mut TechniqueRunner) -> Vec<DaqResult<RunnerItem>> {
        let mut items = Vec::new();
        while let Some(item) = runner.next().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn ocv_run_yields_every_record_then_completes() {
        let driver = MockDriver::default();
        let channel = channel_on(&driver).await;
        let mut runner = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();
        assert_eq!(runner.state(), RunState::Init);

        let items = collect(&mut runner).await;
        let totals: Vec<f64> = items
            .iter()
            .map(|item| match item {
                Ok(RunnerItem::Data(d)) => {
                    assert_eq!(d.tech_index, 0);
                    assert_eq!(d.tech_id, TechId::Ocv);
                    d.data.total_time().unwrap()
                }
                other => panic!("unexpected item {other:?}"),
            })
            .collect();
        assert_eq!(totals.len(), 5);
        assert!(totals.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(runner.state(), RunState::Complete);
        assert!(runner.stop_time().is_some());
        assert!(runner.next().await.is_none());
    }

    #[tokio::test]
    async fn signals_follow_channel_state() {
        let driver = MockDriver::default();
        driver
            .script(
                1,
                vec![
                    RawFrame::status(ProgState::Run),
                    RawFrame::status(ProgState::Pause),
                    ocv_frame(0, 100, ProgState::Run),
                ],
            )
            .unwrap();
        let channel = channel_on(&driver).await;
        let mut runner = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();
        let items: Vec<_> = collect(&mut runner).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(items[0], RunnerItem::DataWait);
        assert_eq!(items[1], RunnerItem::Paused);
        assert!(matches!(items[2], RunnerItem::Data(_)));
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn mismatched_frames_are_skipped() {
        let driver = MockDriver::default();
        driver
            .script(
                1,
                vec![
                    ocv_frame(3, 100, ProgState::Run),
                    ocv_frame(0, 101, ProgState::Run),
                    ocv_frame(0, 100, ProgState::Run),
                ],
            )
            .unwrap();
        let channel = channel_on(&driver).await;
        let mut runner = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();
        let items = collect(&mut runner).await;
        assert_eq!(items.len(), 1);
        assert!(runner.error().is_none());
    }

    #[tokio::test]
    async fn unpack_error_stops_the_channel_and_is_kept() {
        let driver = MockDriver::default();
        let bad = RawFrame {
            cols: 2,
            rows: 1,
            data: vec![0, 1],
            ..ocv_frame(0, 100, ProgState::Run)
        };
        driver.script(1, vec![bad]).unwrap();
        let channel = channel_on(&driver).await;
        let mut runner = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();
        let err = runner.next().await.unwrap().unwrap_err();
        assert!(matches!(err, DaqError::RuntimeFrame(_)));
        assert!(matches!(runner.error(), Some(DaqError::RuntimeFrame(_))));
        assert_eq!(runner.state(), RunState::Error);
        assert!(runner.stop_time().is_some());
        assert!(driver.calls().contains(&MockCall::Stop { channel: 1 }));
        assert!(runner.next().await.is_none());
    }

    #[tokio::test]
    async fn drain_delivers_every_record_without_interrupt() {
        let driver = MockDriver::default();
        let channel = channel_on(&driver).await;
        let mut runner = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();
        let mut records = Vec::new();
        runner
            .drain(&CancellationToken::new(), Duration::from_millis(1), |data| {
                records.push(data);
                Ok::<_, DaqError>(())
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(runner.state(), RunState::Complete);
    }

    #[tokio::test]
    async fn interrupted_drain_keeps_records_already_read() {
        let driver = MockDriver::new(MockConfig {
            frames_per_technique: 2,
            rows_per_frame: 3,
            ..MockConfig::default()
        });
        let channel = channel_on(&driver).await;
        let mut runner = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();

        // Interrupt after the first record: the rest of its frame still arrives.
        let interrupt = CancellationToken::new();
        let mut totals = Vec::new();
        runner
            .drain(&interrupt, Duration::from_millis(1), |data| {
                totals.push(data.data.total_time().unwrap());
                interrupt.cancel();
                Ok::<_, DaqError>(())
            })
            .await
            .unwrap();
        assert_eq!(totals.len(), 3);
        assert!(totals.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(runner.state(), RunState::Cancelled);
        assert!(driver.calls().contains(&MockCall::Stop { channel: 1 }));
        assert!(!channel.is_busy().await.unwrap());
        assert!(runner.next().await.is_none());
    }

    #[tokio::test]
    async fn drain_stops_at_a_record_error() {
        let driver = MockDriver::default();
        let channel = channel_on(&driver).await;
        let mut runner = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();
        let mut seen = 0;
        let err = runner
            .drain(&CancellationToken::new(), Duration::from_millis(1), |_| {
                seen += 1;
                Err(DaqError::Transport("consumer gone".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Transport(_)));
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn stop_before_first_pull_yields_nothing() {
        let driver = MockDriver::default();
        let channel = channel_on(&driver).await;
        let mut runner = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();
        channel.stop().await.unwrap();
        let items = collect(&mut runner).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().is_cancellation());
        assert_eq!(runner.state(), RunState::Cancelled);
        assert!(!channel.is_busy().await.unwrap());
    }

    #[tokio::test]
    async fn finished_runner_cannot_stop_a_newer_run() {
        let driver = MockDriver::new(MockConfig {
            frames_per_technique: 1,
            ..MockConfig::default()
        });
        let channel = channel_on(&driver).await;
        let mut first = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();
        assert!(collect(&mut first).await.iter().all(Result::is_ok));
        let second = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();
        // The finished runner no longer owns the channel.
        first.stop().await.unwrap();
        assert!(second.is_active().await);
        second.stop().await.unwrap();
        assert!(!second.is_active().await);
    }

    #[tokio::test]
    async fn metadata_reports_run_status() {
        let driver = MockDriver::default();
        let channel = channel_on(&driver).await;
        let mut runner = channel.run_techniques(vec![ocv(5.0)]).await.unwrap();
        let running = runner.metadata().await.unwrap();
        assert_eq!(running.status, RunState::Init);
        assert_eq!(running.channel, 1);
        assert_eq!(running.library_version, "6.04");
        assert!(running.stop_time.is_none());

        collect(&mut runner).await;
        let done = runner.metadata().await.unwrap();
        assert_eq!(done.status, RunState::Complete);
        assert!(done.stop_time.is_some());
    }
}
