use crate::error::ProvisionError;

/// Credentials and endpoint for the virtualization management API.
/// All four are required (the provider is constructed with the full set);
/// sourced from the environment so they never live in the config tree.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub endpoint: String,
    pub api_token: String,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification (self-signed cluster certs).
    pub insecure: bool,
}

impl ProviderSettings {
    pub fn from_env() -> Result<Self, ProvisionError> {
        Ok(Self {
            endpoint: require_env("PROXUP_ENDPOINT")?,
            api_token: require_env("PROXUP_API_TOKEN")?,
            username: require_env("PROXUP_USERNAME")?,
            password: require_env("PROXUP_PASSWORD")?,
            insecure: flag_env("PROXUP_INSECURE")?,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, ProvisionError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ProvisionError::MissingSetting { name }),
    }
}

fn flag_env(name: &'static str) -> Result<bool, ProvisionError> {
    match std::env::var(name) {
        Err(_) => Ok(false),
        Ok(value) => match value.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            other => Err(ProvisionError::InvalidSetting {
                name,
                message: format!("expected a boolean, got '{other}'"),
            }),
        },
    }
}
