pub mod auth;
pub mod completion;
pub mod config;
pub mod error;
pub mod rpc;
pub mod runtime;
pub mod session;
pub mod store;
pub mod sync;
