pub mod schema;

pub use schema::{
    default_config_path, AuthConfig, Config, DatabaseConfig, GatewayConfig, JWT_SECRET_ENV,
};
