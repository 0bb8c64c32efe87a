mod error;
mod handlers;
mod server;

pub use error::{ApiError, ApiResult};
pub use handlers::AppState;
pub use server::Server;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const DEFAULT_API_PORT: u16 = 4168;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_API_PORT,
        }
    }
}

impl Config {
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}
