pub mod common;
pub mod config;
pub mod error;
pub mod events;
pub mod options;
pub mod outgoing;
pub mod passes;
pub mod proxy;
pub mod server;
pub mod socket;
pub mod transport;

pub use config::Config;
pub use error::ProxyError;
pub use events::{EventKind, ProxyEvent};
pub use options::{CookieRewrite, Location, ProxyOptions, Target, TlsMaterial};
pub use proxy::{CallOptions, Inbound, ProxyServer};
pub use transport::Agent;
