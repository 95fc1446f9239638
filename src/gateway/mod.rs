//! Gateway server implementation: pipeline middleware, the reverse proxy,
//! the HTTP route table, and process bootstrap.

mod middleware;
mod proxy;
mod router;
mod server;
mod state;

pub use server::Gateway;
pub use state::{AppState, ResolvedRoute, RouteTable};
