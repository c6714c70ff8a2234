use crate::api::ServerConfig;

pub mod server;

pub enum Action {
    Server(Box<ServerConfig>),
}
