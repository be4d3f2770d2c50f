pub mod connection;
pub mod methods;
pub mod trace;
pub mod ws;

pub use methods::{CallContext, RpcServerState};
