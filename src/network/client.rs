//! Job client.

use super::protocol::{self, DataPayload, JobRequest, ServerMessage, DEFAULT_MAX_FRAME_LEN};
use crate::error::{DaqError, DaqResult};
use tokio::net::TcpStream;
use tracing::debug;

/// Submits one job and reads its results.
///
/// ```no_run
/// use potentiostat_daq::network::{JobClient, JobRequest};
///
/// # async fn submit(request: JobRequest) -> potentiostat_daq::DaqResult<()> {
/// let mut client = JobClient::connect("127.0.0.1:6001").await?;
/// client.submit(&request).await?;
/// while let Some(payload) = client.next_record().await? {
///     println!("{} {}", payload.tech_index, payload.data);
/// }
/// # Ok(())
/// # }
/// ```
pub struct JobClient {
    stream: TcpStream,
    max_frame_len: usize,
    finished: bool,
}

impl JobClient {
    /// Opens a connection to the server at `addr`.
    pub async fn connect(addr: &str) -> DaqResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DaqError::Transport(format!("cannot reach job server at {addr}: {e}")))?;
        debug!(addr, "Connected to job server");
        Ok(Self {
            stream,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            finished: false,
        })
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Sends the job. Only one job may be submitted per connection.
    pub async fn submit(&mut self, request: &JobRequest) -> DaqResult<()> {
        protocol::send_message(&mut self.stream, request, self.max_frame_len).await
    }

    /// Next record of the job; `None` once the server reported it done.
    ///
    /// An `error` message from the server is returned as [`DaqError::Remote`].
    pub async fn next_record(&mut self) -> DaqResult<Option<DataPayload>> {
        if self.finished {
            return Ok(None);
        }
        let message =
            protocol::recv_message::<_, ServerMessage>(&mut self.stream, self.max_frame_len)
                .await?;
        match message {
            Some(ServerMessage::Data { payload, .. }) => Ok(Some(payload)),
            Some(ServerMessage::Done { channel }) => {
                debug!(channel, "Job done");
                self.finished = true;
                Ok(None)
            }
            Some(ServerMessage::Error { error, traceback }) => {
                self.finished = true;
                Err(DaqError::Remote {
                    message: error,
                    traceback,
                })
            }
            None => {
                self.finished = true;
                Err(DaqError::Transport(
                    "server closed the connection before the job finished".to_string(),
                ))
            }
        }
    }

    /// Reads every remaining record of the job.
    pub async fn collect(&mut self) -> DaqResult<Vec<DataPayload>> {
        let mut records = Vec::new();
        while let Some(payload) = self.next_record().await? {
            records.push(payload);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::techniques::TechId;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn payload(total_time: f64) -> DataPayload {
        DataPayload {
            tech_index: 0,
            tech_id: TechId::Ocv,
            data: json!({"time": 0.0, "total_time": total_time, "Ewe": 0.1}),
        }
    }

    /// Accepts one connection, reads the job and replies with `messages`.
    async fn scripted_server(messages: Vec<ServerMessage>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _job: Option<JobRequest> =
                protocol::recv_message(&mut stream, DEFAULT_MAX_FRAME_LEN)
                    .await
                    .unwrap();
            for message in &messages {
                protocol::send_message(&mut stream, message, DEFAULT_MAX_FRAME_LEN)
                    .await
                    .unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn records_end_at_done() {
        let addr = scripted_server(vec![
            ServerMessage::Data { channel: 1, payload: payload(1.0) },
            ServerMessage::Data { channel: 1, payload: payload(2.0) },
            ServerMessage::Done { channel: 1 },
        ])
        .await;
        let mut client = JobClient::connect(&addr).await.unwrap();
        client.submit(&JobRequest::new(1, &[])).await.unwrap();

        assert_eq!(client.next_record().await.unwrap(), Some(payload(1.0)));
        assert_eq!(client.next_record().await.unwrap(), Some(payload(2.0)));
        assert_eq!(client.next_record().await.unwrap(), None);
        // Done is sticky; the socket is not read again.
        assert_eq!(client.next_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn server_error_stops_the_stream() {
        let addr = scripted_server(vec![
            ServerMessage::Data { channel: 1, payload: payload(1.0) },
            ServerMessage::Error {
                error: "Precondition failed".to_string(),
                traceback: String::new(),
            },
        ])
        .await;
        let mut client = JobClient::connect(&addr).await.unwrap();
        client.submit(&JobRequest::new(1, &[])).await.unwrap();

        match client.collect().await.unwrap_err() {
            DaqError::Remote { message, .. } => assert_eq!(message, "Precondition failed"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(client.next_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_without_done_is_a_transport_error() {
        let addr = scripted_server(vec![ServerMessage::Data { channel: 1, payload: payload(1.0) }]).await;
        let mut client = JobClient::connect(&addr).await.unwrap();
        client.submit(&JobRequest::new(1, &[])).await.unwrap();

        assert!(client.next_record().await.unwrap().is_some());
        assert!(matches!(client.next_record().await, Err(DaqError::Transport(_))));
    }
}
