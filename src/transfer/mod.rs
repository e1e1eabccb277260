//! Outbound chunking and inbound reassembly for the transfer protocol
//! (spec §4.2-§4.3).

pub mod chunker;
pub mod digester;
pub mod source;

pub use chunker::FileChunker;
pub use digester::{ArtifactHandle, FileDigester};
pub use source::{ChunkSource, MemorySource};

#[cfg(target_arch = "wasm32")]
pub use source::js_source::JsFileSource;
