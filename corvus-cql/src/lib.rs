//! Wire-level layer of the corvus driver: native-protocol framing (versions
//! 3 through 5), request/response frame bodies, the server error taxonomy
//! and serialization of bound values.
//!
//! This crate is purely functional over byte buffers (plus a couple of async
//! helpers reading whole frames from a stream). It holds no sockets and no
//! cluster state; that is the `corvus` crate's job.

pub mod errors;
pub mod frame;
pub mod serialize;

pub use errors::{DbError, WriteType};
pub use frame::types::{Consistency, SerialConsistency};
pub use frame::{Compression, ProtocolVersion};
