//! Configuration file parsing and validation
//!
//! The configuration file is JSON. It describes the models that can be launched and the groups
//! that decide which of them may run side by side. Everything here is validated once at load time;
//! the rest of the crate treats a [`Config`] as immutable.
use anyhow::{Context, Result, bail};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Group that absorbs every model not assigned to an explicit group.
pub const DEFAULT_GROUP_ID: &str = "(default)";

/// Health check timeouts below this many seconds are raised to it.
pub const MIN_HEALTH_CHECK_TIMEOUT_SECS: u64 = 15;

/// Placeholder in a model command that is replaced with the port the model must listen on.
pub const PORT_MACRO: &str = "${PORT}";

/// `checkEndpoint` value that disables health checking.
pub const HEALTH_CHECK_DISABLED: &str = "none";

fn default_check_endpoint() -> String {
    "/health".to_string()
}

fn default_true() -> bool {
    true
}

/// A launchable backend model.
///
/// ## Launching
/// `cmd` is tokenised with shell-like quoting. If `proxy` is unset a free local port is picked on
/// every start and substituted for `${PORT}` in the command.
///
/// ## Rewriting requests
/// `use_model_name` replaces the `model` field sent upstream, `message_prefix` is prepended to the
/// first user message, and `cache_prompt` is injected when the client did not set it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[builder(into)]
    pub cmd: String,
    pub proxy: Option<Url>,
    #[serde(default)]
    #[builder(default)]
    pub aliases: Vec<String>,
    /// `KEY=VALUE` entries added to the process environment.
    #[serde(default)]
    #[builder(default)]
    pub env: Vec<String>,
    #[serde(default = "default_check_endpoint")]
    #[builder(into, default = default_check_endpoint())]
    pub check_endpoint: String,
    /// Seconds without requests before the model is unloaded. 0 disables.
    #[serde(default)]
    #[builder(default)]
    pub ttl: u64,
    /// Hidden from `/v1/models`.
    #[serde(default)]
    #[builder(default)]
    pub unlisted: bool,
    #[builder(into)]
    pub use_model_name: Option<String>,
    #[serde(alias = "message_prefix")]
    #[builder(into)]
    pub message_prefix: Option<String>,
    #[serde(alias = "cache_prompt")]
    pub cache_prompt: Option<bool>,
}

impl ModelConfig {
    /// The command split into program and arguments.
    pub fn sanitized_command(&self) -> Result<Vec<String>> {
        split_command(&self.cmd)
    }

    /// Environment overrides as key/value pairs. Entries were validated at load time.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|entry| entry.split_once('='))
    }

    pub fn idle_ttl(&self) -> Option<Duration> {
        (self.ttl > 0).then(|| Duration::from_secs(self.ttl))
    }

    pub fn health_check_enabled(&self) -> bool {
        !self.check_endpoint.is_empty() && self.check_endpoint != HEALTH_CHECK_DISABLED
    }
}

/// Swap and exclusivity policy shared by a set of models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct GroupConfig {
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub swap: bool,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub exclusive: bool,
    #[serde(default)]
    #[builder(default)]
    pub persistent: bool,
    #[serde(default)]
    #[builder(default)]
    pub members: Vec<String>,
}

/// The configuration file as written on disk, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Seconds to wait for a model to pass its health check.
    #[serde(default)]
    #[builder(default)]
    pub health_check_timeout: u64,
    #[builder(into)]
    pub log_level: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub log_requests: bool,
    #[serde(default)]
    #[builder(default)]
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    #[builder(default)]
    pub groups: HashMap<String, GroupConfig>,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub health_check_timeout: Duration,
    pub log_level: Option<String>,
    pub log_requests: bool,
    pub models: HashMap<String, ModelConfig>,
    pub groups: BTreeMap<String, GroupConfig>,
    /// alias -> model id
    aliases: HashMap<String, String>,
}

impl Config {
    /// Load and validate a configuration file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_json(&contents)
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(contents).context("Failed to parse config")?;
        Self::from_config_file(file)
    }

    pub fn from_config_file(file: ConfigFile) -> Result<Self> {
        let health_check_timeout =
            Duration::from_secs(file.health_check_timeout.max(MIN_HEALTH_CHECK_TIMEOUT_SECS));

        let mut models = HashMap::with_capacity(file.models.len());
        for (id, mut model) in file.models {
            normalize_model(&mut model);
            validate_model(&id, &model)?;
            models.insert(id, model);
        }

        let mut aliases = HashMap::new();
        for (id, model) in &models {
            for alias in &model.aliases {
                if models.contains_key(alias) {
                    bail!("alias {alias} of model {id} collides with a model id");
                }
                if let Some(other) = aliases.insert(alias.clone(), id.clone()) {
                    bail!("alias {alias} is used by both {other} and {id}");
                }
            }
        }

        let groups = add_default_group(&models, file.groups)?;
        validate_membership(&models, &groups)?;

        Ok(Self {
            health_check_timeout,
            log_level: file.log_level,
            log_requests: file.log_requests,
            models,
            groups,
            aliases,
        })
    }

    /// Resolve a model id or alias to the canonical model id.
    pub fn real_model_name<'a>(&'a self, search: &'a str) -> Option<&'a str> {
        if self.models.contains_key(search) {
            Some(search)
        } else {
            self.aliases.get(search).map(String::as_str)
        }
    }

    pub fn find_config<'a>(&'a self, search: &'a str) -> Option<(&'a str, &'a ModelConfig)> {
        let id = self.real_model_name(search)?;
        self.models.get(id).map(|config| (id, config))
    }
}

fn normalize_model(model: &mut ModelConfig) {
    for field in [&mut model.use_model_name, &mut model.message_prefix] {
        if field.as_deref().is_some_and(str::is_empty) {
            *field = None;
        }
    }
}

fn validate_model(id: &str, model: &ModelConfig) -> Result<()> {
    model
        .sanitized_command()
        .with_context(|| format!("invalid cmd for model {id}"))?;

    if let Some(bad) = model
        .env
        .iter()
        .find(|entry| !matches!(entry.split_once('='), Some((key, _)) if !key.is_empty()))
    {
        bail!("invalid env entry {bad:?} for model {id}, expected KEY=VALUE");
    }

    if model.proxy.is_none() && !model.cmd.contains(PORT_MACRO) {
        bail!("model {id} has no proxy address and its cmd does not use {PORT_MACRO}");
    }
    Ok(())
}

/// Put every model that no group claims into the default group.
fn add_default_group(
    models: &HashMap<String, ModelConfig>,
    groups: HashMap<String, GroupConfig>,
) -> Result<BTreeMap<String, GroupConfig>> {
    if groups.contains_key(DEFAULT_GROUP_ID) {
        bail!("group id {DEFAULT_GROUP_ID} is reserved");
    }

    let claimed: HashSet<&str> = groups
        .values()
        .flat_map(|group| group.members.iter().map(String::as_str))
        .collect();

    let mut orphans: Vec<String> = models
        .keys()
        .filter(|id| !claimed.contains(id.as_str()))
        .cloned()
        .collect();
    orphans.sort();

    let mut groups: BTreeMap<String, GroupConfig> = groups.into_iter().collect();
    groups.insert(
        DEFAULT_GROUP_ID.to_string(),
        GroupConfig::builder().members(orphans).build(),
    );
    Ok(groups)
}

fn validate_membership(
    models: &HashMap<String, ModelConfig>,
    groups: &BTreeMap<String, GroupConfig>,
) -> Result<()> {
    let mut member_usage: HashMap<&str, &str> = HashMap::new();
    for (group_id, group) in groups {
        let mut seen = HashSet::new();
        for member in &group.members {
            if !seen.insert(member.as_str()) {
                bail!("duplicate model member {member} found in group: {group_id}");
            }
            if !models.contains_key(member) {
                bail!("group {group_id} references unknown model {member}");
            }
            if let Some(existing) = member_usage.insert(member, group_id) {
                bail!("model member {member} is used in multiple groups: {existing} and {group_id}");
            }
        }
    }
    Ok(())
}

/// Split a command line into arguments with shell-like quoting.
///
/// Backslash-newline continuations are joined first so multi-line commands read as one line.
pub fn split_command(cmd: &str) -> Result<Vec<String>> {
    let cmd = cmd.replace("\\\r\n", " ").replace("\\\n", " ");
    let args = shlex::split(&cmd).context("unterminated quote or trailing backslash in command")?;
    if args.is_empty() {
        bail!("empty command");
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(cmd: &str) -> ModelConfig {
        ModelConfig::builder().cmd(cmd).build()
    }

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "healthCheckTimeout": 60,
            "logRequests": true,
            "models": {
                "llama": {
                    "cmd": "llama-server --port ${PORT} -m llama.gguf",
                    "aliases": ["gpt-4o-mini", "small"],
                    "env": ["CUDA_VISIBLE_DEVICES=0"],
                    "ttl": 300,
                    "useModelName": "llama-3",
                    "message_prefix": "/no_think ",
                    "cachePrompt": true
                },
                "mistral": {
                    "cmd": "mistral-server",
                    "proxy": "http://127.0.0.1:9002",
                    "checkEndpoint": "none",
                    "unlisted": true
                }
            },
            "groups": {
                "gpu": { "exclusive": false, "members": ["mistral"] }
            }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.health_check_timeout, Duration::from_secs(60));
        assert!(config.log_requests);
        assert_eq!(config.models.len(), 2);

        let llama = &config.models["llama"];
        assert_eq!(llama.check_endpoint, "/health");
        assert_eq!(llama.idle_ttl(), Some(Duration::from_secs(300)));
        assert_eq!(llama.use_model_name.as_deref(), Some("llama-3"));
        assert_eq!(llama.message_prefix.as_deref(), Some("/no_think "));
        assert_eq!(llama.cache_prompt, Some(true));
        assert_eq!(
            llama.env_pairs().collect::<Vec<_>>(),
            vec![("CUDA_VISIBLE_DEVICES", "0")]
        );

        let mistral = &config.models["mistral"];
        assert!(!mistral.health_check_enabled());
        assert!(mistral.unlisted);
        assert_eq!(mistral.idle_ttl(), None);

        let gpu = &config.groups["gpu"];
        assert!(gpu.swap);
        assert!(!gpu.exclusive);
        assert!(!gpu.persistent);
        assert_eq!(config.groups[DEFAULT_GROUP_ID].members, vec!["llama"]);
    }

    #[test]
    fn test_health_check_timeout_floor() {
        let config = Config::from_json(r#"{"healthCheckTimeout": 3}"#).unwrap();
        assert_eq!(
            config.health_check_timeout,
            Duration::from_secs(MIN_HEALTH_CHECK_TIMEOUT_SECS)
        );

        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.health_check_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_aliases_resolve_to_model_ids() {
        let mut models = HashMap::new();
        models.insert(
            "model1".to_string(),
            ModelConfig::builder()
                .cmd("server --port ${PORT}")
                .aliases(vec!["m1".to_string(), "first".to_string()])
                .build(),
        );
        let config =
            Config::from_config_file(ConfigFile::builder().models(models).build()).unwrap();

        assert_eq!(config.real_model_name("model1"), Some("model1"));
        assert_eq!(config.real_model_name("m1"), Some("model1"));
        assert_eq!(config.real_model_name("first"), Some("model1"));
        assert_eq!(config.real_model_name("nope"), None);

        let (id, _) = config.find_config("first").unwrap();
        assert_eq!(id, "model1");
    }

    #[test]
    fn test_duplicate_alias_is_rejected() {
        let mut models = HashMap::new();
        for id in ["a", "b"] {
            models.insert(
                id.to_string(),
                ModelConfig::builder()
                    .cmd("server --port ${PORT}")
                    .aliases(vec!["shared".to_string()])
                    .build(),
            );
        }
        let err = Config::from_config_file(ConfigFile::builder().models(models).build())
            .unwrap_err();
        assert!(err.to_string().contains("alias shared"));
    }

    #[test]
    fn test_alias_colliding_with_model_id_is_rejected() {
        let mut models = HashMap::new();
        models.insert("a".to_string(), model("server --port ${PORT}"));
        models.insert(
            "b".to_string(),
            ModelConfig::builder()
                .cmd("server --port ${PORT}")
                .aliases(vec!["a".to_string()])
                .build(),
        );
        assert!(Config::from_config_file(ConfigFile::builder().models(models).build()).is_err());
    }

    #[test]
    fn test_default_group_holds_all_models_when_no_groups() {
        let mut models = HashMap::new();
        for id in ["model3", "model1", "model2"] {
            models.insert(id.to_string(), model("server --port ${PORT}"));
        }
        let config =
            Config::from_config_file(ConfigFile::builder().models(models).build()).unwrap();

        assert_eq!(config.groups.len(), 1);
        let default = &config.groups[DEFAULT_GROUP_ID];
        assert!(default.swap);
        assert!(default.exclusive);
        assert!(!default.persistent);
        assert_eq!(default.members, vec!["model1", "model2", "model3"]);
    }

    #[test]
    fn test_default_group_only_gets_orphans() {
        let mut models = HashMap::new();
        for id in ["model1", "model2", "model3"] {
            models.insert(id.to_string(), model("server --port ${PORT}"));
        }
        let mut groups = HashMap::new();
        groups.insert(
            "forever".to_string(),
            GroupConfig::builder()
                .persistent(true)
                .members(vec!["model2".to_string()])
                .build(),
        );
        let config = Config::from_config_file(
            ConfigFile::builder().models(models).groups(groups).build(),
        )
        .unwrap();

        assert_eq!(config.groups[DEFAULT_GROUP_ID].members, vec!["model1", "model3"]);
        assert_eq!(config.groups["forever"].members, vec!["model2"]);
    }

    #[test]
    fn test_duplicate_membership_is_rejected() {
        let mut models = HashMap::new();
        models.insert("model1".to_string(), model("server --port ${PORT}"));

        let mut groups = HashMap::new();
        groups.insert(
            "g1".to_string(),
            GroupConfig::builder()
                .members(vec!["model1".to_string(), "model1".to_string()])
                .build(),
        );
        let err = Config::from_config_file(
            ConfigFile::builder()
                .models(models.clone())
                .groups(groups)
                .build(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate model member model1"));

        let mut groups = HashMap::new();
        for id in ["g1", "g2"] {
            groups.insert(
                id.to_string(),
                GroupConfig::builder()
                    .members(vec!["model1".to_string()])
                    .build(),
            );
        }
        let err = Config::from_config_file(
            ConfigFile::builder().models(models).groups(groups).build(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("used in multiple groups"));
    }

    #[test]
    fn test_unknown_member_is_rejected() {
        let mut groups = HashMap::new();
        groups.insert(
            "g1".to_string(),
            GroupConfig::builder()
                .members(vec!["ghost".to_string()])
                .build(),
        );
        let err = Config::from_config_file(ConfigFile::builder().groups(groups).build())
            .unwrap_err();
        assert!(err.to_string().contains("unknown model ghost"));
    }

    #[test]
    fn test_model_without_proxy_needs_port_macro() {
        let mut models = HashMap::new();
        models.insert("model1".to_string(), model("server --port 8080"));
        assert!(Config::from_config_file(ConfigFile::builder().models(models).build()).is_err());

        let mut models = HashMap::new();
        models.insert(
            "model1".to_string(),
            ModelConfig::builder()
                .cmd("server --port 8080")
                .proxy("http://127.0.0.1:8080".parse().unwrap())
                .build(),
        );
        assert!(Config::from_config_file(ConfigFile::builder().models(models).build()).is_ok());
    }

    #[test]
    fn test_invalid_env_is_rejected() {
        let mut models = HashMap::new();
        models.insert(
            "model1".to_string(),
            ModelConfig::builder()
                .cmd("server --port ${PORT}")
                .env(vec!["NOT_AN_ASSIGNMENT".to_string()])
                .build(),
        );
        let err = Config::from_config_file(ConfigFile::builder().models(models).build())
            .unwrap_err();
        assert!(err.to_string().contains("KEY=VALUE"));
    }

    #[test]
    fn test_empty_strings_are_unset() {
        let mut models = HashMap::new();
        models.insert(
            "model1".to_string(),
            ModelConfig::builder()
                .cmd("server --port ${PORT}")
                .use_model_name("")
                .message_prefix("")
                .build(),
        );
        let config =
            Config::from_config_file(ConfigFile::builder().models(models).build()).unwrap();
        assert_eq!(config.models["model1"].use_model_name, None);
        assert_eq!(config.models["model1"].message_prefix, None);
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("llama-server --port ${PORT} -m model.gguf").unwrap(),
            vec!["llama-server", "--port", "${PORT}", "-m", "model.gguf"]
        );
        assert_eq!(
            split_command("server \\\n  --flag \\\n  value").unwrap(),
            vec!["server", "--flag", "value"]
        );
        assert_eq!(
            split_command(r#"server --name 'two words' --path "a \"quoted\" b""#).unwrap(),
            vec!["server", "--name", "two words", "--path", r#"a "quoted" b"#]
        );
        assert_eq!(
            split_command("server a\\ b # trailing comment").unwrap(),
            vec!["server", "a b"]
        );
        assert!(split_command("").is_err());
        assert!(split_command("   # only a comment").is_err());
        assert!(split_command("server 'unterminated").is_err());
        assert!(split_command("server \"unterminated").is_err());
    }
}
