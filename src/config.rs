//! Fleet configuration — server descriptors, validation, and redacted export.

use crate::error::FleetError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Fixed token substituted for secret-looking values on export.
pub const REDACTION_TOKEN: &str = "[REDACTED]";

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of env-var references to their actual values.
///
/// Each value must be `${VAR}`. Unknown variables resolve to the empty
/// string (same as shell `${UNSET-}`).
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(), // caught by validate(), but handle gracefully
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Whether a key is likely to hold a credential and must be redacted on export.
pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    ["token", "secret", "password", "passwd", "api_key", "apikey", "authorization", "auth"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Supported wire transport kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

/// How strictly a server's startup failures are treated.
///
/// `strict` servers fail fleet startup when they cannot connect; `lenient`
/// servers are logged and left to the recovery path.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Strict,
    #[default]
    Lenient,
}

/// Declarative description of one managed server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TransportKind,
    // stdio fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    // network fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    // common
    #[serde(rename = "timeout", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(rename = "connectionMode", default)]
    pub connection_mode: ConnectionMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl ServerDescriptor {
    /// Minimal constructor for a stdio server; network fields stay empty.
    pub fn stdio(name: &str, command: &str) -> Self {
        ServerDescriptor {
            name: name.to_string(),
            kind: TransportKind::Stdio,
            command: Some(command.to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            timeout_ms: default_timeout_ms(),
            connection_mode: ConnectionMode::default(),
            enabled: true,
        }
    }

    /// Validate this descriptor in isolation, failing fast before any
    /// transport is constructed.
    pub fn validate(&self) -> crate::Result<()> {
        let name = &self.name;

        if name.is_empty()
            || name.contains('/')
            || !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(FleetError::ConfigInvalid(
                name.clone(),
                "name must be non-empty alphanumeric with hyphens or underscores, no slashes"
                    .to_string(),
            ));
        }

        match self.kind {
            TransportKind::Stdio => {
                if self.command.is_none() {
                    return Err(FleetError::ConfigInvalid(
                        name.clone(),
                        "stdio transport requires 'command' field".to_string(),
                    ));
                }
                if self.url.is_some() {
                    return Err(FleetError::ConfigInvalid(
                        name.clone(),
                        "stdio transport should not have 'url' field".to_string(),
                    ));
                }
            }
            TransportKind::Sse | TransportKind::StreamableHttp => {
                if self.url.is_none() {
                    return Err(FleetError::ConfigInvalid(
                        name.clone(),
                        format!("{:?} transport requires 'url' field", self.kind),
                    ));
                }
                if self.command.is_some() {
                    return Err(FleetError::ConfigInvalid(
                        name.clone(),
                        "network transport should not have 'command' field".to_string(),
                    ));
                }
            }
        }

        if self.timeout_ms == 0 {
            return Err(FleetError::ConfigInvalid(
                name.clone(),
                "timeout must be greater than zero".to_string(),
            ));
        }

        // env values must be ${VAR} references so secrets never live in config
        for (key, value) in &self.env {
            if parse_env_ref(value).is_none() {
                return Err(FleetError::ConfigInvalid(
                    name.clone(),
                    format!("env value for key '{}' must be a ${{VAR}} reference, got '{}'", key, value),
                ));
            }
        }

        Ok(())
    }

    /// Copy of this descriptor with secret-looking env and header values
    /// replaced by the redaction token. Non-secret fields are untouched, so
    /// an export/import round-trip preserves them exactly.
    pub fn redacted(&self) -> ServerDescriptor {
        let mut out = self.clone();
        for (key, value) in out.env.iter_mut() {
            if is_secret_key(key) {
                *value = REDACTION_TOKEN.to_string();
            }
        }
        for (key, value) in out.headers.iter_mut() {
            if is_secret_key(key) {
                *value = REDACTION_TOKEN.to_string();
            }
        }
        out
    }
}

/// Top-level fleet configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerDescriptor>,
}

impl FleetConfig {
    /// Validate the whole config, failing fast on misconfiguration before
    /// any connection is started. Disabled servers skip field validation
    /// but still count for name uniqueness.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for descriptor in self.servers.values() {
            if !seen.insert(descriptor.name.as_str()) {
                return Err(FleetError::DuplicateServer(descriptor.name.clone()));
            }
        }

        for descriptor in self.servers.values() {
            if !descriptor.enabled {
                continue;
            }
            descriptor.validate()?;
        }

        Ok(())
    }

    /// Enabled descriptors in name order.
    pub fn enabled_servers(&self) -> Vec<&ServerDescriptor> {
        let mut out: Vec<&ServerDescriptor> =
            self.servers.values().filter(|d| d.enabled).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Serialize the config to TOML with secrets redacted.
    pub fn to_redacted_toml(&self) -> crate::Result<String> {
        let redacted = FleetConfig {
            servers: self
                .servers
                .iter()
                .map(|(k, d)| (k.clone(), d.redacted()))
                .collect(),
        };
        toml::to_string_pretty(&redacted)
            .map_err(|e| FleetError::ConfigInvalid("export".to_string(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_toml(toml_str: &str) -> FleetConfig {
        toml::from_str(toml_str).expect("valid TOML")
    }

    #[test]
    fn test_parse_env_ref() {
        assert_eq!(parse_env_ref("${FOO}"), Some("FOO"));
        assert_eq!(parse_env_ref("${GH_TOKEN}"), Some("GH_TOKEN"));
        assert_eq!(parse_env_ref("$FOO"), None);
        assert_eq!(parse_env_ref("literal"), None);
        assert_eq!(parse_env_ref("${"), None);
    }

    #[test]
    fn test_resolve_env_vars() {
        // SAFETY: test-only, no concurrent threads depend on this env var.
        unsafe { std::env::set_var("CIPHER_TEST_VAR", "resolved_value") };
        let mut env = HashMap::new();
        env.insert("KEY".to_string(), "${CIPHER_TEST_VAR}".to_string());
        let resolved = resolve_env_vars(&env);
        assert_eq!(resolved.get("KEY").unwrap(), "resolved_value");
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("CIPHER_TEST_VAR") };
    }

    #[test]
    fn test_valid_stdio_config() {
        let config = parse_toml(
            r#"
            [servers.github]
            name = "gh"
            type = "stdio"
            command = "gh-mcp"
            args = ["--port", "8080"]
            "#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_valid_sse_config() {
        let config = parse_toml(
            r#"
            [servers.myapi]
            name = "myapi"
            type = "sse"
            url = "https://api.example.com/events"
            "#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_valid_streamable_http_config() {
        let config = parse_toml(
            r#"
            [servers.myapi]
            name = "myapi"
            type = "streamable-http"
            url = "https://api.example.com/rpc"
            "#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_name_fails() {
        let config = parse_toml(
            r#"
            [servers.a]
            name = "same"
            type = "stdio"
            command = "cmd-a"

            [servers.b]
            name = "same"
            type = "stdio"
            command = "cmd-b"
            "#,
        );
        let result = config.validate();
        assert!(matches!(result, Err(FleetError::DuplicateServer(s)) if s == "same"));
    }

    #[test]
    fn test_stdio_missing_command() {
        let config = parse_toml(
            r#"
            [servers.gh]
            name = "gh"
            type = "stdio"
            "#,
        );
        let result = config.validate();
        assert!(
            matches!(result, Err(FleetError::ConfigInvalid(name, msg)) if name == "gh" && msg.contains("command"))
        );
    }

    #[test]
    fn test_network_missing_url() {
        let config = parse_toml(
            r#"
            [servers.api]
            name = "api"
            type = "sse"
            "#,
        );
        let result = config.validate();
        assert!(
            matches!(result, Err(FleetError::ConfigInvalid(name, msg)) if name == "api" && msg.contains("url"))
        );
    }

    #[test]
    fn test_mixed_transport_fields_rejected() {
        let config = parse_toml(
            r#"
            [servers.mixed]
            name = "mixed"
            type = "stdio"
            command = "some-cmd"
            url = "https://example.com"
            "#,
        );
        let result = config.validate();
        assert!(
            matches!(result, Err(FleetError::ConfigInvalid(name, msg)) if name == "mixed" && msg.contains("url"))
        );
    }

    #[test]
    fn test_disabled_server_skips_field_validation() {
        let config = parse_toml(
            r#"
            [servers.broken]
            name = "broken"
            type = "stdio"
            enabled = false
            # command missing — but disabled, so should pass
            "#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_var_reference_required() {
        let config = parse_toml(
            r#"
            [servers.gh]
            name = "gh"
            type = "stdio"
            command = "gh-mcp"

            [servers.gh.env]
            GITHUB_TOKEN = "literal-secret"
            "#,
        );
        let result = config.validate();
        assert!(
            matches!(result, Err(FleetError::ConfigInvalid(name, msg)) if name == "gh" && msg.contains("GITHUB_TOKEN"))
        );
    }

    #[test]
    fn test_timeout_default() {
        let config = parse_toml(
            r#"
            [servers.gh]
            name = "gh"
            type = "stdio"
            command = "gh-mcp"
            "#,
        );
        let server = config.servers.get("gh").unwrap();
        assert_eq!(server.timeout_ms, 30_000);
        assert_eq!(server.connection_mode, ConnectionMode::Lenient);
        assert!(server.enabled);
    }

    #[test]
    fn test_name_with_slash_rejected() {
        // '/' is the external tool namespace separator and cannot appear in names
        let mut descriptor = ServerDescriptor::stdio("a/b", "cmd");
        descriptor.name = "a/b".to_string();
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_secret_key_detection() {
        assert!(is_secret_key("GITHUB_TOKEN"));
        assert!(is_secret_key("Authorization"));
        assert!(is_secret_key("api_key"));
        assert!(is_secret_key("DB_PASSWORD"));
        assert!(!is_secret_key("PATH"));
        assert!(!is_secret_key("RUST_LOG"));
    }

    #[test]
    fn test_redacted_export_round_trip() {
        let mut descriptor = ServerDescriptor::stdio("gh", "gh-mcp");
        descriptor.args = vec!["--verbose".to_string()];
        descriptor
            .env
            .insert("GITHUB_TOKEN".to_string(), "${GITHUB_TOKEN}".to_string());
        descriptor
            .env
            .insert("RUST_LOG".to_string(), "${RUST_LOG}".to_string());

        let mut config = FleetConfig::default();
        config.servers.insert("gh".to_string(), descriptor);

        let exported = config.to_redacted_toml().unwrap();
        let imported: FleetConfig = toml::from_str(&exported).unwrap();
        let got = imported.servers.get("gh").unwrap();

        // Non-secret fields survive byte-for-byte
        assert_eq!(got.name, "gh");
        assert_eq!(got.command.as_deref(), Some("gh-mcp"));
        assert_eq!(got.args, vec!["--verbose".to_string()]);
        assert_eq!(got.timeout_ms, 30_000);
        assert_eq!(got.env.get("RUST_LOG").unwrap(), "${RUST_LOG}");
        // Secret values replaced by the fixed token and not restored
        assert_eq!(got.env.get("GITHUB_TOKEN").unwrap(), REDACTION_TOKEN);
    }

    #[test]
    fn test_redacted_headers() {
        let mut descriptor = ServerDescriptor {
            name: "api".to_string(),
            kind: TransportKind::StreamableHttp,
            command: None,
            args: vec![],
            env: HashMap::new(),
            url: Some("https://api.example.com/rpc".to_string()),
            headers: HashMap::new(),
            timeout_ms: 30_000,
            connection_mode: ConnectionMode::Strict,
            enabled: true,
        };
        descriptor
            .headers
            .insert("Authorization".to_string(), "Bearer abc123".to_string());
        descriptor
            .headers
            .insert("X-Trace".to_string(), "on".to_string());

        let redacted = descriptor.redacted();
        assert_eq!(redacted.headers.get("Authorization").unwrap(), REDACTION_TOKEN);
        assert_eq!(redacted.headers.get("X-Trace").unwrap(), "on");
        // original untouched
        assert_eq!(descriptor.headers.get("Authorization").unwrap(), "Bearer abc123");
    }

    #[test]
    fn test_enabled_servers_sorted() {
        let config = parse_toml(
            r#"
            [servers.z]
            name = "zeta"
            type = "stdio"
            command = "z"

            [servers.a]
            name = "alpha"
            type = "stdio"
            command = "a"

            [servers.d]
            name = "delta"
            type = "stdio"
            command = "d"
            enabled = false
            "#,
        );
        let names: Vec<&str> = config.enabled_servers().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
