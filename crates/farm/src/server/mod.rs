//! Server-side counterpart: the encode server, its per-job processor and
//! the chunked file store.

pub mod encode_server;
pub mod file_store;
pub mod job_processor;

pub use encode_server::{EncodeServer, EncodeServerConfig, ServerError};
pub use file_store::FileStore;
pub use job_processor::{JobProcessor, ProcessorUpdate};
