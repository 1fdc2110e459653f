pub mod addr;
pub mod balance;
pub mod breaker;
pub mod client;
pub mod context;
pub mod coord;
pub mod discovery;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod health;
pub mod registration;
pub mod server;


pub use client::Client;
pub use client::ClientOptions;
pub use context::CallContext;
pub use discovery::DiscoveryClient;
pub use server::Handler;
pub use server::Server;
pub use server::ServerOptions;
