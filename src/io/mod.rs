//! I/O utilities
//!
//! Bidirectional copy used to splice an accepted TCP flow onto its host
//! connection.

mod copy;

pub use copy::{bidirectional_copy, bidirectional_copy_with_buffer, CopyResult, DEFAULT_BUFFER_SIZE};
