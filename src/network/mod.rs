//! Job server, job client and their wire protocol.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::JobClient;
pub use protocol::{DataPayload, Job, JobRequest, ServerMessage};
pub use server::{JobServer, ServerContext, ServerSettings};
