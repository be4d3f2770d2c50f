// Live sessions and the push channel.

pub mod registry;

pub use registry::{Outbound, SessionRegistration, SessionRegistry};
