use chat_core::config::{ChatSettings, CompletionSettings, IdentitySettings, TelemetrySettings};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub identity: IdentitySettings,
    pub completion: CompletionSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Mark the session cookie `Secure`; needs HTTPS.
    #[serde(default)]
    pub secure_cookies: bool,
    /// Inactivity window for both the cookie and the server-side chat session.
    #[serde(default = "default_session_idle_hours")]
    pub session_idle_hours: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_session_idle_hours() -> i64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    300
}

/// Plain environment variables honoured on top of `APP_…` overrides, mapped
/// to their configuration keys.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("AZURE_CLIENT_ID", "identity.client_id"),
    ("AZURE_CLIENT_SECRET", "identity.client_secret"),
    ("AZURE_TENANT_ID", "identity.tenant_id"),
    ("REDIRECT_URI", "identity.redirect_uri"),
    ("AZURE_OPENAI_ENDPOINT", "completion.endpoint"),
    ("AZURE_OPENAI_API_VERSION", "completion.api_version"),
];

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("Cannot read working directory: {}", e)))?;

    // Run from the workspace root or from the crate directory.
    let configuration_directory = if base_path.ends_with("chat-frontend") {
        base_path.join("config")
    } else {
        base_path.join("chat-frontend").join("config")
    };

    let mut builder = config::Config::builder()
        .add_source(config::File::from(configuration_directory.join("base.yaml")).required(true))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        );

    for (variable, key) in ENV_OVERRIDES {
        builder = builder.set_override_option(*key, non_empty_env(variable))?;
    }

    // Managed identity needs both values; half a pair is ignored.
    if let (Some(endpoint), Some(header)) =
        (non_empty_env("IDENTITY_ENDPOINT"), non_empty_env("IDENTITY_HEADER"))
    {
        builder = builder
            .set_override("identity.service_credential.managed_identity.endpoint", endpoint)?
            .set_override("identity.service_credential.managed_identity.header", header)?;
    }

    builder.build()?.try_deserialize::<Settings>()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
