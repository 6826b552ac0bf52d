//! Job wire protocol.
//!
//! Every message is a frame: a 4-byte big-endian body length followed by the body,
//! a JSON document. A connection carries one job:
//!
//! ```text
//! client                                  server
//!   │── {usb_port, channel, techniques} ──►│
//!   │◄── {type: "data", channel, payload} ─│  (once per record)
//!   │◄── {type: "done", channel} ──────────│  or {type: "error", error, traceback}
//! ```
//!
//! A connection closed before or inside the length prefix is a clean close, not an
//! error.

use crate::error::{DaqError, DaqResult};
use crate::runner::IndexedData;
use crate::schema::NativeEnum;
use crate::techniques::{TechId, Technique, TechniqueData, TechniqueKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// Job as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Instrument address; the server's default address when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb_port: Option<String>,
    /// Channel number, counted from 1. Checked by the server.
    pub channel: i64,
    /// `{tech_id, params}` descriptions, run in order.
    pub techniques: Vec<Value>,
}

impl JobRequest {
    /// Job for `channel` on the server's default instrument.
    pub fn new(channel: i64, techniques: &[Technique]) -> Self {
        Self {
            usb_port: None,
            channel,
            techniques: techniques.iter().map(Technique::to_structured).collect(),
        }
    }

    /// Targets the instrument at `address` instead of the default one.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.usb_port = Some(address.into());
        self
    }

    /// Parses the technique descriptions into a [`Job`].
    pub fn into_job(self, default_address: &str) -> DaqResult<Job> {
        let techniques = self
            .techniques
            .iter()
            .map(Technique::from_structured)
            .collect::<DaqResult<Vec<_>>>()?;
        Ok(Job {
            address: self.usb_port.unwrap_or_else(|| default_address.to_string()),
            channel: self.channel,
            techniques,
        })
    }
}

/// A parsed job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Instrument address, the default already filled in.
    pub address: String,
    /// Channel number as sent; not yet checked against the instrument.
    pub channel: i64,
    pub techniques: Vec<Technique>,
}

/// One record on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    pub tech_index: usize,
    pub tech_id: TechId,
    /// Structured form of the record.
    pub data: Value,
}

impl From<&IndexedData> for DataPayload {
    fn from(indexed: &IndexedData) -> Self {
        Self {
            tech_index: indexed.tech_index,
            tech_id: indexed.tech_id,
            data: indexed.data.to_structured(),
        }
    }
}

impl DataPayload {
    /// Typed record of this payload.
    pub fn record(&self) -> DaqResult<TechniqueData> {
        let kind = TechniqueKind::from_id(self.tech_id)
            .ok_or_else(|| DaqError::UnknownTechnique(self.tech_id.name().to_string()))?;
        TechniqueData::from_structured(kind, &self.data)
    }
}

/// Server to client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// One record of the running job.
    Data { channel: i64, payload: DataPayload },
    /// The run ended; nothing follows.
    Done { channel: i64 },
    /// The job failed. Ends the connection like `Done`.
    Error { error: String, traceback: String },
}

impl ServerMessage {
    /// Report of `error`, with its source chain as the traceback.
    pub fn error(error: &DaqError) -> Self {
        Self::Error {
            error: error.to_string(),
            traceback: error.traceback(),
        }
    }
}

/// Writes one frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_len: usize) -> DaqResult<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > max_len {
        return Err(DaqError::Protocol(format!(
            "frame of {} bytes exceeds the {max_len} byte limit",
            body.len()
        )));
    }
    let len = u32::try_from(body.len())
        .map_err(|_| DaqError::Protocol(format!("frame of {} bytes is too long", body.len())))?;
    let mut buf = Vec::with_capacity(PREFIX_LEN + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(body);
    writer
        .write_all(&buf)
        .await
        .map_err(|e| DaqError::Transport(format!("failed to send frame: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| DaqError::Transport(format!("failed to flush frame: {e}")))
}

/// Reads one frame; `None` when the peer closed the connection before a full
/// length prefix arrived.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> DaqResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    let mut filled = 0;
    while filled < PREFIX_LEN {
        let n = reader
            .read(&mut prefix[filled..])
            .await
            .map_err(|e| DaqError::Transport(format!("failed to read frame length: {e}")))?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(DaqError::Protocol(format!(
            "frame of {len} bytes exceeds the {max_len} byte limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| DaqError::Transport(format!("connection closed inside a frame: {e}")))?;
    Ok(Some(body))
}

/// Serializes `message` and writes it as one frame.
pub async fn send_message<W, T>(writer: &mut W, message: &T, max_len: usize) -> DaqResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    write_frame(writer, &body, max_len).await
}

/// Reads one frame and parses it; `None` on a clean close.
pub async fn recv_message<R, T>(reader: &mut R, max_len: usize) -> DaqResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader, max_len).await? {
        Some(body) => serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| DaqError::Protocol(format!("malformed message: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::techniques::OcvData;
    use serde_json::json;

    #[tokio::test]
    async fn frames_carry_a_big_endian_length() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"{}", DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(wire, [0, 0, 0, 2, b'{', b'}']);
        let body = read_frame(&mut wire.as_slice(), DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        assert_eq!(body.as_deref(), Some(&b"{}"[..]));
    }

    #[tokio::test]
    async fn short_prefix_is_a_clean_close() {
        let empty: &[u8] = &[];
        assert!(read_frame(&mut &*empty, 64).await.unwrap().is_none());
        let partial: &[u8] = &[0, 0];
        assert!(read_frame(&mut &*partial, 64).await.unwrap().is_none());
        let truncated: &[u8] = &[0, 0, 0, 9, b'x'];
        assert!(matches!(
            read_frame(&mut &*truncated, 64).await,
            Err(DaqError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut wire = Vec::new();
        let err = write_frame(&mut wire, &[0u8; 10], 8).await.unwrap_err();
        assert!(matches!(err, DaqError::Protocol(_)));
        let header: &[u8] = &[0, 0, 1, 0];
        assert!(matches!(
            read_frame(&mut &*header, 8).await,
            Err(DaqError::Protocol(_))
        ));
    }

    #[test]
    fn server_messages_are_tagged() {
        let done = serde_json::to_value(ServerMessage::Done { channel: 2 }).unwrap();
        assert_eq!(done, json!({"type": "done", "channel": 2}));

        let data = ServerMessage::Data {
            channel: 1,
            payload: DataPayload {
                tech_index: 0,
                tech_id: TechId::Ocv,
                data: json!({"time": 0.5, "total_time": 1.5, "Ewe": 0.2}),
            },
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["type"], json!("data"));
        assert_eq!(value["payload"]["tech_id"], json!("OCV"));
        let back: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, data);

        let err = ServerMessage::error(&DaqError::Precondition("channel 1 is busy".into()));
        let value = serde_json::to_value(err).unwrap();
        assert_eq!(value["type"], json!("error"));
        assert!(value["traceback"].as_str().unwrap().starts_with("PreconditionFailure"));
    }

    #[test]
    fn payload_decodes_to_typed_record() {
        let payload = DataPayload {
            tech_index: 1,
            tech_id: TechId::Ocv,
            data: json!({"time": 0.5, "total_time": 1.5, "Ewe": 0.25}),
        };
        let record = payload.record().unwrap();
        assert_eq!(
            record,
            TechniqueData::Ocv(OcvData {
                time: 0.5,
                total_time: 1.5,
                ewe: 0.25,
                ece: None,
            })
        );
    }

    #[test]
    fn job_defaults_to_the_configured_address() {
        let request: JobRequest = serde_json::from_value(json!({
            "channel": 1,
            "techniques": [{
                "tech_id": "OCV",
                "params": {"rest_time_T": 10.0, "record_every_dE": 0.01, "record_every_dT": 0.5}
            }]
        }))
        .unwrap();
        let job = request.clone().into_job("USB0").unwrap();
        assert_eq!(job.address, "USB0");
        assert_eq!(job.techniques[0].kind(), TechniqueKind::Ocv);
        let job = request.with_address("USB2").into_job("USB0").unwrap();
        assert_eq!(job.address, "USB2");
    }

    #[test]
    fn unknown_technique_fails_to_parse() {
        let request = JobRequest {
            usb_port: None,
            channel: 1,
            techniques: vec![json!({"tech_id": "EIS9000", "params": {}})],
        };
        assert!(matches!(
            request.into_job("USB0"),
            Err(DaqError::UnknownTechnique(_))
        ));
    }
}
