pub mod engine;
pub mod message;
pub mod transport;
pub mod validation;

pub use engine::Engine;
pub use message::SipMessage;
pub use transport::SipTransport;
