//! Wire protocol for talking to a hypervisor's machine-control monitor.
//!
//! Frames are UTF-8 JSON objects, one per line, over a reliable duplex
//! byte stream (usually a Unix socket). The client sends [`Request`]s;
//! the monitor answers each with a [`Reply`] carrying the same id and
//! interleaves unsolicited [`Event`]s. The very first frame on a new
//! connection is a [`Greeting`].

mod codec;
mod message;

pub use codec::{MAX_FRAME, encode, read_line, recv, send};
pub use message::{
    CAP_OOB, ErrorInfo, Event, Frame, Greeting, NEGOTIATE, Reply, Request, Timestamp,
};
