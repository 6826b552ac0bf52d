//! # Potentiostat DAQ
//!
//! Host software for electrochemical potentiostats. The crate defines the
//! measurement programs ("techniques") an instrument can run, loads them onto a
//! channel, streams the resulting records back as typed data, and shares one
//! instrument between many remote clients through a job server.
//!
//! ## Crate Structure
//!
//! - **`schema`**: declarative parameter and record descriptors. Parameters validate
//!   against the connected device, pack into the instrument's native form, and
//!   convert to and from a portable JSON form.
//! - **`techniques`**: the closed set of techniques (OCV, CA, CP, CV, PEIS, LP, CPP,
//!   PZIR), each with its parameter schema, record schema, timebase, program files
//!   and raw-row unpacking.
//! - **`device`**: the instrument driver interface, device and channel information,
//!   a simulated driver, and the connected [`device::Potentiostat`].
//! - **`channel`**: the per-channel state machine: validation, hardware limits,
//!   loading, start and safe stop, plus the channel message listener.
//! - **`runner`**: pulls raw frames of a run and turns them into indexed records.
//! - **`metadata`**: the end-of-run summary.
//! - **`network`**: the length-prefixed JSON job protocol, the job server and the
//!   job client.
//! - **`config`** / **`logging`**: Figment configuration and tracing setup.
//! - **`error`**: the crate-wide [`DaqError`].

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod network;
pub mod runner;
pub mod schema;
pub mod techniques;

pub use error::{DaqError, DaqResult};
