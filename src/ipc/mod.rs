//! Message channel between the coordinator and the worker subprocess.

mod envelope;
mod transport;

pub use envelope::Envelope;
pub use transport::{FrameReceiver, FrameSender};
