pub mod relay;

pub use relay::{RtpRelay, RtpStreamInfo};
