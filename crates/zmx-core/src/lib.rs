//! Protocol-level building blocks shared by the zmx client and daemon:
//! the framed wire codec, the non-blocking socket buffers, session-name
//! encoding, and the error taxonomy.

pub mod buffer;
pub mod error;
pub mod frame;
pub mod name;
