mod account_store;
mod database;
mod token_store;

pub use account_store::{Account, AccountStore, AuthStatus, LifecycleState};
pub use database::{Database, StoreError, default_data_dir, now_unix};
pub use token_store::{Token, TokenStore};

