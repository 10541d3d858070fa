use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug, Default)]
#[command(name = "sandrun", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to an optional JSON configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Address the HTTP server binds to
    #[arg(long, env = "SANDRUN_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Port the HTTP server binds to
    #[arg(long, env = "SANDRUN_BIND_PORT")]
    pub bind_port: Option<u16>,

    /// Maximum number of jobs running at the same time
    #[arg(long, short = 't', env = "SANDRUN_CONCURRENCY_LIMIT")]
    pub concurrency_limit: Option<usize>,

    /// Wall-clock timeout of every compile or run stage, in milliseconds
    #[arg(long, env = "SANDRUN_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Cap applied separately to stdout and stderr of every stage
    #[arg(long, env = "SANDRUN_MAX_OUTPUT_BYTES")]
    pub max_output_bytes: Option<u64>,

    /// Directory under which per-job workspaces are created
    #[arg(long, env = "SANDRUN_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Never wrap commands with the external isolation tool
    #[arg(long, env = "SANDRUN_NO_SANDBOX", default_value_t = false)]
    pub no_sandbox: bool,
}

impl CliArgs {
    /// Load the configuration file (if any) and apply command line overrides
    pub fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(address) = &self.bind_address {
            config.server.bind_address = Some(address.clone());
        }
        if let Some(port) = self.bind_port {
            config.server.bind_port = Some(port);
        }
        if let Some(limit) = self.concurrency_limit {
            config.engine.concurrency_limit = limit;
        }
        if let Some(timeout) = self.timeout_ms {
            config.engine.per_job_timeout_ms = MilliSecond(timeout);
        }
        if let Some(bytes) = self.max_output_bytes {
            config.engine.max_output_bytes = ByteSize(bytes);
        }
        if let Some(root) = &self.workspace_root {
            config.engine.workspace_root = Some(root.clone());
        }
        if self.no_sandbox {
            config.engine.sandbox_prefix_enabled = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub toolchains: ToolchainConfig,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open configuration file {path}"))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse configuration file {path}"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.concurrency_limit == 0 {
            bail!("The concurrency limit must not be 0");
        }
        if self.engine.per_job_timeout_ms.0 == 0 {
            bail!("The per-stage timeout must not be 0");
        }
        if self.engine.max_output_bytes.0 == 0 {
            bail!("The output cap must not be 0");
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub concurrency_limit: usize,
    pub per_job_timeout_ms: MilliSecond,
    pub max_output_bytes: ByteSize,
    /// Falls back to [`default_workspace_root`] when unset
    pub workspace_root: Option<PathBuf>,
    pub sandbox_prefix_enabled: bool,
    /// Serialize compile errors as `{"stderr": ...}` instead of `{"error": ...}`
    pub legacy_compile_error_shape: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            per_job_timeout_ms: MilliSecond(5000),
            max_output_bytes: ByteSize(64 * 1024),
            workspace_root: None,
            sandbox_prefix_enabled: true,
            legacy_compile_error_shape: false,
        }
    }
}

impl EngineConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(default_workspace_root)
    }
}

/// Executable names of the language toolchains, looked up in `PATH`
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ToolchainConfig {
    pub cpp_compiler: String,
    pub java_compiler: String,
    pub java_runtime: String,
    pub python: String,
    pub node: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            cpp_compiler: "g++".to_string(),
            java_compiler: "javac".to_string(),
            java_runtime: "java".to_string(),
            python: "python3".to_string(),
            node: "node".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for std::time::Duration {
    fn from(value: MilliSecond) -> Self {
        std::time::Duration::from_millis(value.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl TryFrom<ByteSize> for usize {
    type Error = anyhow::Error;

    fn try_from(value: ByteSize) -> Result<Self> {
        usize::try_from(value.0)
            .with_context(|| format!("{} bytes does not fit in this platform's usize", value.0))
    }
}

/// Per-user cache directory, or the system temp directory when no home exists
pub fn default_workspace_root() -> PathBuf {
    use directories::ProjectDirs;

    match ProjectDirs::from("", "", "sandrun") {
        Some(proj_dirs) => proj_dirs.cache_dir().join("workspaces"),
        None => std::env::temp_dir().join("sandrun"),
    }
}
