// Wire protocol shared by the server and its clients.

pub mod errors;
pub mod push;
pub mod rpc;
pub mod rpc_methods;
