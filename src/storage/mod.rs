//! Persistence adapter: the state model, its JSON document and the stores
//! that hold it.

mod document;
mod store;
mod types;

pub use document::{decode, encode, load_state, save_state, LoadError, PersistError};
pub use store::{FileStore, MemoryStore, StateStore, StoreError};
pub use types::{Entry, Source, State, UnreadSource, UnreadView, UNCATEGORIZED};
