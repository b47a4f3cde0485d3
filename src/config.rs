use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the optional per-project override file.
pub const PROJECT_CONFIG_FILE: &str = ".specprompt";

/// Status of config file loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLoadStatus {
    /// Config loaded successfully from existing file
    Loaded,
    /// Created default config file (first run)
    Created,
    /// Error occurred during loading, using defaults.
    Error(String),
}

/// Generation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Claude CLI executable. A bare name is looked up on `PATH`.
    pub command: String,
    /// Extra arguments placed before the streaming flags.
    pub args: Vec<String>,
    /// How long a cancelled generation may take to shut down before it is aborted.
    pub cancel_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            cancel_timeout_ms: 3000,
        }
    }
}

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// User template directory. Defaults to `templates/` in the config directory.
    pub templates: Option<String>,
    /// Naming suffix that marks a file as a specification document.
    pub spec_suffix: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            templates: None,
            spec_suffix: ".spec.md".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityConfig {
    /// Where users share and discuss templates. Empty disables the picker link.
    pub discussion_url: String,
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub community: CommunityConfig,
}

impl Config {
    /// Expand `~` to home directory in a path string
    pub fn expand_tilde(path: &str) -> PathBuf {
        if let Some(stripped) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(stripped);
        }
        PathBuf::from(path)
    }

    /// The backend executable with `~` expanded. Bare names are left for `PATH` lookup.
    pub fn backend_command(&self) -> PathBuf {
        Self::expand_tilde(&self.backend.command)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.cancel_timeout_ms)
    }

    /// The configured template directory, or the default under the config directory.
    pub fn templates_dir(&self) -> Option<PathBuf> {
        match &self.paths.templates {
            Some(path) => Some(Self::expand_tilde(path)),
            None => get_config_dir().map(|dir| dir.join("templates")),
        }
    }
}

/// Partial backend configuration for project overrides.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PartialBackendConfig {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub cancel_timeout_ms: Option<u64>,
}

/// Partial path configuration for project overrides.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PartialPathsConfig {
    pub templates: Option<String>,
    pub spec_suffix: Option<String>,
}

/// Partial logging configuration for project overrides.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PartialLoggingConfig {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PartialCommunityConfig {
    pub discussion_url: Option<String>,
}

/// Project-specific configuration where every field is optional.
/// Parsed from `.specprompt` files. Fields that are `None` inherit from the global config.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PartialConfig {
    pub backend: PartialBackendConfig,
    pub paths: PartialPathsConfig,
    pub logging: PartialLoggingConfig,
    pub community: PartialCommunityConfig,
}

/// Merge a global config with a project-level partial config.
/// Project values override global values where present.
pub fn merge_config(global: &Config, project: &PartialConfig) -> Config {
    Config {
        backend: BackendConfig {
            command: project
                .backend
                .command
                .clone()
                .unwrap_or_else(|| global.backend.command.clone()),
            args: project
                .backend
                .args
                .clone()
                .unwrap_or_else(|| global.backend.args.clone()),
            cancel_timeout_ms: project
                .backend
                .cancel_timeout_ms
                .unwrap_or(global.backend.cancel_timeout_ms),
        },
        paths: PathsConfig {
            templates: project
                .paths
                .templates
                .clone()
                .or_else(|| global.paths.templates.clone()),
            spec_suffix: project
                .paths
                .spec_suffix
                .clone()
                .unwrap_or_else(|| global.paths.spec_suffix.clone()),
        },
        logging: LoggingConfig {
            level: project
                .logging
                .level
                .clone()
                .unwrap_or_else(|| global.logging.level.clone()),
        },
        community: CommunityConfig {
            discussion_url: project
                .community
                .discussion_url
                .clone()
                .unwrap_or_else(|| global.community.discussion_url.clone()),
        },
    }
}

/// Loaded configuration with metadata
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_path: PathBuf,
    pub project_config_path: Option<PathBuf>,
    pub status: ConfigLoadStatus,
}

/// Get the platform-appropriate config directory
fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("dev", "specprompt", "specprompt")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the full path to the config file
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

/// The project config path (`.specprompt` in the project root), if the file exists.
pub fn get_project_config_path(root: &Path) -> Option<PathBuf> {
    let path = root.join(PROJECT_CONFIG_FILE);
    if path.exists() { Some(path) } else { None }
}

/// Load a project config from the given path.
fn load_project_config(path: &Path) -> Result<PartialConfig, String> {
    let contents = fs::read_to_string(path).map_err(|e| {
        warn!(path = ?path, error = %e, "project_config_read_failed");
        format!("Failed to read {}: {}", PROJECT_CONFIG_FILE, e)
    })?;

    toml::from_str::<PartialConfig>(&contents).map_err(|e| {
        warn!(path = ?path, error = %e, "project_config_parse_failed");
        format!("Invalid {}: {}", PROJECT_CONFIG_FILE, e)
    })
}

/// Load configuration for a project root from file, environment, and defaults
pub fn load_config(root: &Path) -> LoadedConfig {
    let Some(config_path) = get_config_path() else {
        warn!("config_dir_unavailable");
        return LoadedConfig {
            config: apply_env_overrides(Config::default()),
            config_path: PathBuf::from("config.toml"),
            project_config_path: None,
            status: ConfigLoadStatus::Error("Could not determine config directory".to_string()),
        };
    };
    debug!(path = ?config_path, "config_path");

    let (config, status) = load_or_create_config(&config_path);
    let project_config_path = get_project_config_path(root);
    let config = layer_project_config(config, project_config_path.as_deref());

    LoadedConfig {
        config: apply_env_overrides(config),
        config_path,
        project_config_path,
        status,
    }
}

/// Apply a project override file on top of `config`. A broken file is logged and ignored.
fn layer_project_config(config: Config, project_path: Option<&Path>) -> Config {
    let Some(project_path) = project_path else {
        return config;
    };
    match load_project_config(project_path) {
        Ok(partial) => {
            info!(path = ?project_path, "project_config_loaded");
            merge_config(&config, &partial)
        }
        Err(e) => {
            warn!(path = ?project_path, error = %e, "project_config_error");
            config
        }
    }
}

/// Load config from file, or create default if not exists
fn load_or_create_config(config_path: &Path) -> (Config, ConfigLoadStatus) {
    match fs::read_to_string(config_path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                info!(path = ?config_path, "config_loaded");
                (config, ConfigLoadStatus::Loaded)
            }
            Err(e) => {
                warn!(path = ?config_path, error = %e, "config_malformed");
                (
                    Config::default(),
                    ConfigLoadStatus::Error(format!("Malformed TOML: {}", e)),
                )
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => create_default_config(config_path),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            warn!(path = ?config_path, "config_permission_denied");
            (
                Config::default(),
                ConfigLoadStatus::Error("Permission denied reading config".to_string()),
            )
        }
        Err(e) => {
            warn!(path = ?config_path, error = %e, "config_read_failed");
            (
                Config::default(),
                ConfigLoadStatus::Error(format!("Read error: {}", e)),
            )
        }
    }
}

/// Create the default config file
fn create_default_config(config_path: &Path) -> (Config, ConfigLoadStatus) {
    let config = Config::default();

    if let Some(parent) = config_path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        warn!(path = ?parent, error = %e, "config_dir_create_failed");
        return (
            config,
            ConfigLoadStatus::Error(format!("Could not create config directory: {}", e)),
        );
    }

    let toml_content = match toml::to_string_pretty(&config) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "config_serialize_failed");
            return (
                config,
                ConfigLoadStatus::Error(format!("Serialization error: {}", e)),
            );
        }
    };

    match fs::write(config_path, &toml_content) {
        Ok(()) => {
            info!(path = ?config_path, "config_created");
            (config, ConfigLoadStatus::Created)
        }
        Err(e) => {
            warn!(path = ?config_path, error = %e, "config_write_failed");
            (
                config,
                ConfigLoadStatus::Error(format!("Could not write config: {}", e)),
            )
        }
    }
}

/// Apply environment variable overrides to config
fn apply_env_overrides(config: Config) -> Config {
    apply_overrides(config, |name| env::var(name).ok())
}

fn apply_overrides(mut config: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(command) = var("SPECPROMPT_BACKEND_COMMAND") {
        debug!("Overriding backend.command from SPECPROMPT_BACKEND_COMMAND");
        config.backend.command = command;
    }

    if let Some(path) = var("SPECPROMPT_TEMPLATES_DIR") {
        debug!("Overriding paths.templates from SPECPROMPT_TEMPLATES_DIR");
        config.paths.templates = Some(path);
    }

    if let Some(suffix) = var("SPECPROMPT_SPEC_SUFFIX") {
        debug!("Overriding paths.spec_suffix from SPECPROMPT_SPEC_SUFFIX");
        config.paths.spec_suffix = suffix;
    }

    if let Some(level) = var("SPECPROMPT_LOG") {
        debug!("Overriding logging.level from SPECPROMPT_LOG");
        config.logging.level = level;
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend.command, "claude");
        assert!(config.backend.args.is_empty());
        assert_eq!(config.cancel_timeout(), Duration::from_secs(3));
        assert!(config.paths.templates.is_none());
        assert_eq!(config.paths.spec_suffix, ".spec.md");
        assert_eq!(config.logging.level, "info");
        assert!(config.community.discussion_url.is_empty());
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = Config::expand_tilde("~/.config/test");
        assert!(!expanded.to_string_lossy().starts_with('~'));

        let no_tilde = Config::expand_tilde("/absolute/path");
        assert_eq!(no_tilde, PathBuf::from("/absolute/path"));

        let relative = Config::expand_tilde("./relative/path");
        assert_eq!(relative, PathBuf::from("./relative/path"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
[backend]
command = "/custom/claude"
args = ["--model", "opus"]
cancel_timeout_ms = 500

[paths]
templates = "/tmp/templates"
spec_suffix = ".req.md"

[logging]
level = "debug"

[community]
discussion_url = "https://example.com/templates"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.command, "/custom/claude");
        assert_eq!(config.backend.args, vec!["--model", "opus"]);
        assert_eq!(config.cancel_timeout(), Duration::from_millis(500));
        assert_eq!(config.templates_dir(), Some(PathBuf::from("/tmp/templates")));
        assert_eq!(config.paths.spec_suffix, ".req.md");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.community.discussion_url,
            "https://example.com/templates"
        );
    }

    #[test]
    fn test_config_partial_deserialization() {
        let toml_str = r#"
[backend]
command = "/custom/claude"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.command, "/custom/claude");
        assert_eq!(config.backend.cancel_timeout_ms, 3000);
        assert_eq!(config.paths.spec_suffix, ".spec.md");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let toml_str = r#"
[backend]
command = "/custom/claude"
unknown_key = "should be ignored"

[unknown_section]
foo = "bar"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.command, "/custom/claude");
    }

    #[test]
    fn test_default_config_serializes_and_reloads() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let config: Config = toml::from_str(&text).unwrap();
        assert_eq!(config.backend.command, "claude");
        assert!(config.paths.templates.is_none());
    }

    #[test]
    fn test_partial_config_empty() {
        let partial: PartialConfig = toml::from_str("").unwrap();
        assert!(partial.backend.command.is_none());
        assert!(partial.backend.args.is_none());
        assert!(partial.backend.cancel_timeout_ms.is_none());
        assert!(partial.paths.templates.is_none());
        assert!(partial.paths.spec_suffix.is_none());
        assert!(partial.logging.level.is_none());
        assert!(partial.community.discussion_url.is_none());
    }

    #[test]
    fn test_partial_config_comment_only() {
        let partial: PartialConfig = toml::from_str("# project overrides\n").unwrap();
        assert!(partial.backend.command.is_none());
    }

    #[test]
    fn test_merge_config_no_overrides() {
        let global = Config::default();
        let merged = merge_config(&global, &PartialConfig::default());

        assert_eq!(merged.backend.command, global.backend.command);
        assert_eq!(merged.backend.args, global.backend.args);
        assert_eq!(merged.paths.templates, global.paths.templates);
        assert_eq!(merged.paths.spec_suffix, global.paths.spec_suffix);
        assert_eq!(merged.logging.level, global.logging.level);
    }

    #[test]
    fn test_merge_config_partial_overrides() {
        let mut global = Config::default();
        global.paths.templates = Some("/global/templates".to_string());
        let partial: PartialConfig = toml::from_str(
            r#"
[backend]
args = ["--model", "sonnet"]

[community]
discussion_url = "https://example.com/d"
"#,
        )
        .unwrap();
        let merged = merge_config(&global, &partial);

        assert_eq!(merged.backend.args, vec!["--model", "sonnet"]);
        assert_eq!(merged.community.discussion_url, "https://example.com/d");

        assert_eq!(merged.backend.command, global.backend.command);
        assert_eq!(merged.paths.templates.as_deref(), Some("/global/templates"));
        assert_eq!(merged.logging.level, global.logging.level);
    }

    #[test]
    fn test_apply_overrides() {
        let config = apply_overrides(Config::default(), |name| match name {
            "SPECPROMPT_BACKEND_COMMAND" => Some("/opt/claude".to_string()),
            "SPECPROMPT_SPEC_SUFFIX" => Some(".req.md".to_string()),
            _ => None,
        });
        assert_eq!(config.backend.command, "/opt/claude");
        assert_eq!(config.paths.spec_suffix, ".req.md");
        assert!(config.paths.templates.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_or_create_config_creates_then_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let (_, status) = load_or_create_config(&path);
        assert_eq!(status, ConfigLoadStatus::Created);
        assert!(path.exists());

        let (config, status) = load_or_create_config(&path);
        assert_eq!(status, ConfigLoadStatus::Loaded);
        assert_eq!(config.backend.command, "claude");
    }

    #[test]
    fn test_load_or_create_config_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[backend\ncommand = ").unwrap();

        let (config, status) = load_or_create_config(&path);
        assert!(matches!(status, ConfigLoadStatus::Error(_)));
        assert_eq!(config.backend.command, "claude");
    }

    #[test]
    fn test_layer_project_config() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            "[paths]\nspec_suffix = \".req.md\"\n",
        )
        .unwrap();

        let project_path = get_project_config_path(dir.path());
        assert!(project_path.is_some());
        let config = layer_project_config(Config::default(), project_path.as_deref());
        assert_eq!(config.paths.spec_suffix, ".req.md");
    }

    #[test]
    fn test_layer_project_config_invalid_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PROJECT_CONFIG_FILE);
        fs::write(&path, "not = [valid").unwrap();

        let config = layer_project_config(Config::default(), Some(&path));
        assert_eq!(config.paths.spec_suffix, ".spec.md");
    }

    #[test]
    fn test_project_config_absent() {
        let dir = TempDir::new().unwrap();
        assert!(get_project_config_path(dir.path()).is_none());
    }
}
