//! encode-farm
//!
//! Distributes and executes long-running transcoding jobs: a local worker
//! pool runs transcode tasks as supervised OS processes with
//! pause/resume/cancel control, a connection manager talks to remote
//! encode servers over a persistent WebSocket protocol, a discovery loop
//! keeps the server set alive, and a scheduler matches jobs to capable
//! targets and relays progress/completion back to callers.

pub mod client;
pub mod detect;
pub mod discovery;
pub mod jobs;
pub mod matcher;
pub mod messages;
pub mod probe;
pub mod process;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod worker_pool;

pub use encode_farm_config as config;
pub use encode_farm_config::Config;

pub use client::{ClientConfig, ClientError, ConnectionManager};
pub use detect::detect_capabilities;
pub use discovery::ServerDiscovery;
pub use jobs::{EncodeParams, Job, JobStatus, MediaKind, Output, OutputStatus};
pub use matcher::{CapabilityMatcher, ServerScore};
pub use messages::{
    CapabilityMatch, CapabilityReport, EncoderKind, JobProgress, JobResult, JobSpec,
    RemoteJobStatus, ServerCapabilities, ServerInfo, ServerStatus,
};
pub use probe::{DurationProbe, FfprobeDurationProbe};
pub use process::{ProcessControl, ProcessError, SystemProcess};
pub use protocol::{Message, MessageBody, ProtocolError};
pub use scheduler::Scheduler;
pub use server::{EncodeServer, EncodeServerConfig, FileStore, JobProcessor, ServerError};
pub use worker_pool::{CommandBuilder, PoolError, PoolProgressCallback, WorkerPool};
