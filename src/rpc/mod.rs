//! JSON-RPC plumbing over a byte stream.
//!
//! - `codec`: newline framing with a bounded frame length.
//! - `message`: outbound request/notification and inbound message shapes.
//! - `correlator`: id allocation and the pending-request table.
//! - `reader`: the loop that turns stdout bytes into resolved requests and events.

pub mod codec;
pub mod correlator;
pub mod message;
pub mod reader;

pub use codec::{Frame, FrameCodec};
pub use correlator::{Correlator, PendingHandle};
pub use message::{InboundMessage, OutboundMessage, RequestId, RpcErrorObject};
