//! Job server.
//!
//! Each accepted connection is served by its own task. Two kinds of locks keep the
//! instrument consistent while jobs run concurrently:
//!
//! - the connection lock guards the single open instrument connection and its
//!   address; it is held only while a job (re)connects,
//! - one lock per channel, held for the whole run of a job on that channel.
//!
//! A job always takes the connection lock before its channel lock, and never holds
//! both, so jobs on different channels stream side by side while jobs on the same
//! channel run one after another in arrival order.

use super::protocol::{self, DataPayload, JobRequest, ServerMessage};
use crate::config::AppConfig;
use crate::device::{ConnectOptions, Driver, Potentiostat};
use crate::error::{DaqError, DaqResult};
use crate::runner::RunnerItem;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Settings of a [`ServerContext`].
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Address used by jobs that do not name one.
    pub default_address: String,
    /// Size of the channel lock table.
    pub max_channels: usize,
    /// Largest frame accepted from or sent to a client.
    pub max_frame_len: usize,
    /// Pause between polls while the channel has no new data.
    pub data_wait: Duration,
    /// Options for opening the instrument on the first job.
    pub connect: ConnectOptions,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            default_address: "USB0".to_string(),
            max_channels: 4,
            max_frame_len: protocol::DEFAULT_MAX_FRAME_LEN,
            data_wait: Duration::from_millis(100),
            connect: ConnectOptions::default(),
        }
    }
}

impl From<&AppConfig> for ServerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            default_address: config.instrument.default_address.clone(),
            max_channels: config.server.max_channels,
            max_frame_len: config.server.max_frame_len,
            data_wait: Duration::from_millis(config.server.data_wait_ms),
            connect: config.instrument.connect_options(),
        }
    }
}

/// State shared by every connection task.
pub struct ServerContext {
    driver: Arc<dyn Driver>,
    settings: ServerSettings,
    connection: Mutex<Option<Arc<Potentiostat>>>,
    channel_locks: Vec<Mutex<()>>,
}

impl ServerContext {
    /// No instrument is opened until the first job needs one.
    pub fn new(driver: Arc<dyn Driver>, settings: ServerSettings) -> Self {
        let channel_locks = (0..settings.max_channels).map(|_| Mutex::new(())).collect();
        Self {
            driver,
            settings,
            connection: Mutex::new(None),
            channel_locks,
        }
    }

    /// Settings the context was built with.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Position of `channel` in the lock table.
    fn channel_slot(&self, channel: i64) -> DaqResult<usize> {
        usize::try_from(channel)
            .ok()
            .and_then(|n| n.checked_sub(1))
            .filter(|&slot| slot < self.channel_locks.len())
            .ok_or_else(|| {
                DaqError::Precondition(format!(
                    "invalid channel number {channel}: expected 1..={}",
                    self.channel_locks.len()
                ))
            })
    }

    /// Open connection to `address`, replacing a connection to another address.
    async fn connect(&self, address: &str) -> DaqResult<Arc<Potentiostat>> {
        let mut connection = self.connection.lock().await;
        if let Some(current) = connection.as_ref() {
            if current.address() == address && current.is_connected().await {
                return Ok(Arc::clone(current));
            }
        }
        if let Some(previous) = connection.take() {
            info!(address = previous.address(), "Closing instrument connection");
            if let Err(e) = previous.close().await {
                warn!(address = previous.address(), error = %e, "Failed to close connection");
            }
        }
        info!(address, "Connecting to instrument");
        let device = Arc::new(
            Potentiostat::connect(self.driver.as_ref(), address, self.settings.connect.clone())
                .await?,
        );
        *connection = Some(Arc::clone(&device));
        Ok(device)
    }

    /// Closes the open instrument connection, if any.
    pub async fn close(&self) -> DaqResult<()> {
        if let Some(device) = self.connection.lock().await.take() {
            device.close().await?;
        }
        Ok(())
    }

    /// True when an instrument connection is open and still answers.
    pub async fn is_connected(&self) -> bool {
        match self.connection.lock().await.as_ref() {
            Some(device) => device.is_connected().await,
            None => false,
        }
    }
}

/// Accepts job connections.
pub struct JobServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl JobServer {
    /// Binds the listening socket. Use port 0 for an ephemeral port.
    pub async fn bind(addr: &str, context: ServerContext) -> DaqResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Job server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            context: Arc::new(context),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> DaqResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared state, kept alive after the server stops.
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.context)
    }

    /// Serves until the process ends.
    pub async fn run(self) -> DaqResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` completes, then closes the instrument connection.
    pub async fn run_until<F>(self, shutdown: F) -> DaqResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((socket, peer)) => {
                        let context = Arc::clone(&self.context);
                        let job = Uuid::new_v4();
                        tokio::spawn(
                            handle_connection(socket, peer, context)
                                .instrument(info_span!("job", %job, %peer)),
                        );
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = &mut shutdown => {
                    info!("Shutting down job server");
                    break;
                }
            }
        }
        self.context.close().await
    }
}

enum JobFailure {
    /// The job failed; the client is told.
    Failed(DaqError),
    /// The client cannot be reached any more.
    Disconnected(DaqError),
}

impl From<DaqError> for JobFailure {
    fn from(error: DaqError) -> Self {
        Self::Failed(error)
    }
}

async fn handle_connection(mut socket: TcpStream, peer: SocketAddr, context: Arc<ServerContext>) {
    debug!("Client connected");
    let max_len = context.settings.max_frame_len;
    let request = match protocol::recv_message::<_, JobRequest>(&mut socket, max_len).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("Client closed the connection before sending a job");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Failed to read job");
            send_error(&mut socket, &e, max_len).await;
            return;
        }
    };

    match run_job(&context, request, &mut socket).await {
        Ok(()) => info!("Job complete"),
        Err(JobFailure::Disconnected(e)) => warn!(error = %e, "Client {} went away", peer),
        Err(JobFailure::Failed(e)) => {
            error!("Job failed: {}", e.traceback());
            send_error(&mut socket, &e, max_len).await;
        }
    }
}

async fn send_error<W>(writer: &mut W, error: &DaqError, max_len: usize)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = protocol::send_message(writer, &ServerMessage::error(error), max_len).await {
        warn!(error = %e, "Failed to send error message");
    }
}

async fn run_job<S>(
    context: &ServerContext,
    request: JobRequest,
    socket: &mut S,
) -> Result<(), JobFailure>
where
    S: AsyncWrite + Unpin,
{
    let max_len = context.settings.max_frame_len;
    let channel = request.channel;
    let slot = context.channel_slot(channel)?;
    let job = request.into_job(&context.settings.default_address)?;
    info!(
        channel,
        address = %job.address,
        techniques = job.techniques.len(),
        "Job received"
    );

    let device = context.connect(&job.address).await?;
    let _channel_guard = context.channel_locks[slot].lock().await;
    debug!(channel, "Channel lock acquired");
    let mut runner = device.get_channel(slot + 1)?.run_techniques(job.techniques).await?;

    while let Some(item) = runner.next().await {
        match item {
            Ok(RunnerItem::Data(data)) => {
                let message = ServerMessage::Data {
                    channel,
                    payload: DataPayload::from(&data),
                };
                if let Err(e) = protocol::send_message(socket, &message, max_len).await {
                    if let Err(stop_err) = runner.stop().await {
                        warn!(channel, error = %stop_err, "Failed to stop abandoned run");
                    }
                    return Err(JobFailure::Disconnected(e));
                }
            }
            Ok(RunnerItem::Paused | RunnerItem::DataWait) => {
                tokio::time::sleep(context.settings.data_wait).await;
            }
            Err(e) if e.is_cancellation() => {
                info!(channel, "Run was stopped by another actor");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    protocol::send_message(socket, &ServerMessage::Done { channel }, max_len)
        .await
        .map_err(JobFailure::Disconnected)
}
