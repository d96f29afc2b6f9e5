//! Blocking implementations: the ratchet itself, the locked session around it and the stream
//! cipher keyed from it.

mod dr;
mod session;
mod stream;

pub use dr::{DoubleRatchet, LOCAL_GENERATION_FLAG};
pub use session::{RatchetSession, RatchetStats, SessionKeys};
pub use stream::{
    ChunkHeader, RotationCallback, StreamCipher, StreamError, StreamKey, StreamStats,
    CHUNK_HEADER_LEN,
};
