pub mod database;
pub mod error;
pub mod kv;
pub mod schema;
pub mod user_state;

pub use database::Database;
pub use error::StoreError;
pub use kv::KvStore;
pub use user_state::{UserState, UserStateRepo};
