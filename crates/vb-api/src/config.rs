use std::env;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub control_plane_api_key: String,
    pub jwt_secret: String,
    pub monitor_interval_secs: u64,
    /// Leading segment of every generated container id.
    pub container_prefix: String,
    pub ip_discovery_attempts: u32,
    pub ip_discovery_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            listen_addr: env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".into())
                .parse()
                .expect("LISTEN_ADDR must be a valid socket address"),
            control_plane_api_key: env::var("CONTROL_PLANE_API_KEY")
                .expect("CONTROL_PLANE_API_KEY must be set"),
            jwt_secret: env::var("JWT_SECRET").expect("JWT_SECRET must be set"),
            monitor_interval_secs: env::var("MONITOR_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".into())
                .parse()
                .expect("MONITOR_INTERVAL_SECS must be a valid u64"),
            container_prefix: env::var("CONTAINER_PREFIX").unwrap_or_else(|_| "vps".into()),
            ip_discovery_attempts: env::var("IP_DISCOVERY_ATTEMPTS")
                .unwrap_or_else(|_| "3".into())
                .parse()
                .expect("IP_DISCOVERY_ATTEMPTS must be a valid u32"),
            ip_discovery_interval: Duration::from_secs(
                env::var("IP_DISCOVERY_INTERVAL_SECS")
                    .unwrap_or_else(|_| "2".into())
                    .parse()
                    .expect("IP_DISCOVERY_INTERVAL_SECS must be a valid u64"),
            ),
        }
    }
}
