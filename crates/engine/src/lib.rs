//! In-process engine for the transcoding worker (job ledger, dispatcher
//! polling, FFmpeg-driven execution, heartbeat/benchmark tickers).

/// Public API for the engine crate.
pub mod api;

mod benchmark;
mod controller;
pub mod dispatcher;
pub mod executor;
mod heartbeat;
pub mod ledger;
pub mod state;

pub use api::{start_engine, EngineConfig, EngineEvent, EngineHandle, StatusSnapshot};
pub use dispatcher::{DispatcherClient, HttpDispatcherClient, JobDescriptor};
pub use executor::{Outcome, ProcessTranscoder, TranscodeExecutor, Transcoder};
pub use ledger::{DurableJobSet, LedgerError};
pub use state::is_valid_job_state_transition;
