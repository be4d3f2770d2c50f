// parley-common: wire protocol and domain types shared by server and clients.

pub mod history;
pub mod metadata;
pub mod protocol;
pub mod types;
