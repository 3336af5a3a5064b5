pub mod config;
pub mod credentials;
pub mod error;
pub mod handler;
pub mod logging;
pub mod pac;
pub mod router;
pub mod server;

pub use config::Config;
pub use credentials::Credentials;
pub use error::ProxyError;
pub use pac::{PacEvaluator, RouteDecision};
pub use router::Router;
pub use server::{ProxyServer, ServerSettings};
