//! Storage backends: the authoritative accounts table (Postgres), the
//! pending-registration store, and the sessions store (both redis).

pub mod accounts;
pub mod registration;
pub mod sessions;

pub use accounts::{AccountTx, AccountsRepository};
pub use registration::RegistrationStore;
pub use sessions::SessionStore;
