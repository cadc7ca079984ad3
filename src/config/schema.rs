use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides `[auth] jwt_secret`.
pub const JWT_SECRET_ENV: &str = "COURSEGATE_JWT_SECRET";

/// Default access-token lifetime: 5 minutes.
const DEFAULT_ACCESS_TTL_SECS: u64 = 300;

/// Default renewal-token lifetime: 7 days.
const DEFAULT_REFRESH_TTL_SECS: u64 = 7 * 24 * 3600;

const DEFAULT_FAILED_LOGINS_PER_MINUTE: u32 = 10;

/// Top-level process configuration. Loaded once at startup and never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Allow binding to a non-loopback address.
    pub allow_public_bind: bool,
    /// Take the client address from `X-Forwarded-For`/`X-Real-IP`. Only safe
    /// behind a reverse proxy that overwrites those headers.
    pub trust_forwarded_headers: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            allow_public_bind: false,
            trust_forwarded_headers: false,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC signing secret for access and renewal tokens.
    pub jwt_secret: String,
    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
    /// Whether `POST /api/auth/register` is open.
    pub allow_registration: bool,
    /// Maximum registered identities (0 = unlimited).
    pub max_users: u64,
    /// Failed logins allowed per (client, handle) per minute before 429
    /// (0 = unlimited).
    pub failed_logins_per_minute: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_token_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_token_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
            allow_registration: true,
            max_users: 0,
            failed_logins_per_minute: DEFAULT_FAILED_LOGINS_PER_MINUTE,
        }
    }
}

// Hand-written so the secret never lands in logs.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("allow_registration", &self.allow_registration)
            .field("max_users", &self.max_users)
            .field("failed_logins_per_minute", &self.failed_logins_per_minute)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Empty means `<data dir>/coursegate.db`.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load from `path`, or from the platform config dir when `path` is `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an
    /// error. Environment overrides are applied last. Call `validate` before
    /// signing anything; commands that never touch tokens skip it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Priority: environment variable > config file.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(JWT_SECRET_ENV)
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
        {
            self.auth.jwt_secret = secret;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.trim().is_empty() {
            bail!(
                "No signing secret configured. Set [auth] jwt_secret in config.toml \
                 or export {JWT_SECRET_ENV}."
            );
        }
        if self.auth.access_token_ttl_secs == 0 || self.auth.refresh_token_ttl_secs == 0 {
            bail!("Token lifetimes must be greater than zero");
        }
        Ok(())
    }

    /// Resolved SQLite path.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = self.database.path.as_ref().filter(|p| !p.as_os_str().is_empty()) {
            return Ok(path.clone());
        }
        let dirs = project_dirs().context("Could not determine a data directory")?;
        Ok(dirs.data_dir().join("coursegate.db"))
    }

    /// TOML rendering with the signing secret masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.auth.jwt_secret.is_empty() {
            shown.auth.jwt_secret = "***".into();
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "coursegate")
}

/// `<config dir>/config.toml` for the current platform.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_lifetimes() {
        let config = Config::default();
        assert_eq!(config.auth.access_token_ttl_secs, 300);
        assert_eq!(config.auth.refresh_token_ttl_secs, 604_800);
        assert_eq!(config.gateway.port, 8000);
        assert!(config.auth.allow_registration);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [auth]
            jwt_secret = "s3cret"
            access_token_ttl_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.auth.jwt_secret, "s3cret");
        assert_eq!(config.auth.access_token_ttl_secs, 60);
        assert_eq!(config.auth.refresh_token_ttl_secs, 604_800);
        assert_eq!(config.gateway.host, "127.0.0.1");
    }

    #[test]
    fn env_secret_overrides_file() {
        let mut config = Config::from_toml("[auth]\njwt_secret = \"from-file\"").unwrap();
        config.apply_env_overrides(|key| (key == JWT_SECRET_ENV).then(|| " from-env ".into()));
        assert_eq!(config.auth.jwt_secret, "from-env");
    }

    #[test]
    fn blank_env_secret_is_ignored() {
        let mut config = Config::from_toml("[auth]\njwt_secret = \"from-file\"").unwrap();
        config.apply_env_overrides(|_| Some("   ".into()));
        assert_eq!(config.auth.jwt_secret, "from-file");
    }

    #[test]
    fn validate_rejects_missing_secret() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("signing secret"));
    }

    #[test]
    fn validate_rejects_zero_lifetime() {
        let mut config = Config::default();
        config.auth.jwt_secret = "x".into();
        config.auth.refresh_token_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_explicit_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[gateway]\nport = 9100\n[auth]\njwt_secret = \"abc\"\n[database]\npath = \"/tmp/x.db\"\n",
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.gateway.port, 9100);
        assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn load_without_secret_succeeds_until_validated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[gateway]\nport = 9200\n").unwrap();

        let mut config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.gateway.port, 9200);
        assert!(!config.gateway.trust_forwarded_headers);

        config.auth.jwt_secret.clear();
        assert!(config.validate().is_err());
        assert!(config.to_redacted_toml().is_ok());
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(Config::load(Some(&tmp.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn redacted_toml_hides_secret() {
        let mut config = Config::default();
        config.auth.jwt_secret = "very-secret".into();
        let rendered = config.to_redacted_toml().unwrap();
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("***"));
        assert!(!format!("{:?}", config.auth).contains("very-secret"));
    }
}
