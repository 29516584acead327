pub mod client;
pub mod event_bridge;
pub mod gateway;
pub mod handlers;
pub mod rpc;
pub mod server;

pub use gateway::{SessionGateway, SubmitParams, SubmitResult};
pub use server::{start, ServerConfig, ServerHandle};
