// In-memory stores for server-owned entities.

pub mod chats;
pub mod metadata;
pub mod models;
pub mod users;

pub use chats::{ChatList, ChatRecord, ChatStore, ChatView};
pub use metadata::{access_for, Access, MetadataScope, MetadataStore};
pub use models::{ModelPatch, ModelStore};
pub use users::UserStore;
