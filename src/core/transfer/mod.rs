//! Chunked file transfer: adaptive chunk sizing, the sending side driven by
//! delivery receipts, and receive-side reassembly.

pub mod chunker;
pub mod incoming;
pub mod outgoing;

pub use chunker::AdaptiveChunker;
pub use incoming::{IncomingFileView, IncomingTransfers};
pub use outgoing::OutgoingFileTransfer;
