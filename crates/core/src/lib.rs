pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod finalize;
pub mod normalizer;
pub mod protocol;
pub mod reconnect;
pub mod recorder;
pub mod request;
pub mod serializer;
pub mod session;
pub mod timeline;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::EngineConfig;
pub use engine::{EventStream, FinalizeTicket, StreamSession, Submission};
pub use error::EngineError;
pub use event::{CanonicalEvent, FinalizeComplete, SessionNotice};
pub use protocol::{Negotiation, Payload, VendorProtocol};
pub use recorder::{Direction, Recorder};
pub use request::{RequestSnapshot, StreamingRequest};
pub use session::SessionState;
