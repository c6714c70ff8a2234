pub mod api;
pub mod cli;
pub mod crypto;
pub mod error;
pub mod events;
pub mod models;
pub mod repository;
pub mod service;

#[cfg(test)]
mod tests {
    use crate::api::{APP_USER_AGENT, GIT_COMMIT_HASH};

    #[test]
    fn user_agent_carries_name_and_version() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.ends_with(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn commit_hash_is_never_empty() {
        assert!(!GIT_COMMIT_HASH.is_empty());
    }
}
