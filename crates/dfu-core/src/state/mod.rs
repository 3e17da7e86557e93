//! Flash session state: the state machine, its persistence and handlers.

pub mod handlers;
pub mod machine;
pub mod store;

pub use handlers::{HandleResult, HandlerContext, handle_click, handle_resume};
pub use machine::{FlashState, SessionContext, UnknownState};
pub use store::{FileStore, MemoryStore, SessionStore};
