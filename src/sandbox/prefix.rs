use std::path::Path;

/// External isolation tool probed for at startup
const ISOLATION_TOOL: &str = "firejail";

/// Flags passed to the isolation tool; `%WORKSPACE%` is the job directory
const TOOL_FLAGS: [&str; 4] = [
    "--quiet",
    "--noprofile",
    "--net=none",
    "--private=%WORKSPACE%",
];

/// Whether commands get wrapped with the isolation tool
///
/// Decided once at startup and shared read-only by every pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxPrefix {
    tool: Option<String>,
}

impl SandboxPrefix {
    pub fn disabled() -> Self {
        Self { tool: None }
    }

    pub fn with_tool(tool: impl Into<String>) -> Self {
        Self {
            tool: Some(tool.into()),
        }
    }

    /// Probes `PATH` for the isolation tool when `enabled`
    pub fn detect(enabled: bool) -> Self {
        if !enabled {
            log::info!("Sandbox prefix disabled by configuration");
            return Self::disabled();
        }

        let found = std::process::Command::new("which")
            .arg(ISOLATION_TOOL)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);

        if found {
            log::info!("Found {ISOLATION_TOOL}, commands will run inside it");
            Self::with_tool(ISOLATION_TOOL)
        } else {
            log::warn!(
                "{ISOLATION_TOOL} not found - commands run WITHOUT isolation, use only in trusted environments"
            );
            Self::disabled()
        }
    }

    pub fn is_active(&self) -> bool {
        self.tool.is_some()
    }

    /// Rewrites `program args...` into `tool flags... -- program args...`
    pub fn wrap(&self, program: &str, args: &[String], workspace: &Path) -> (String, Vec<String>) {
        let Some(tool) = &self.tool else {
            return (program.to_string(), args.to_vec());
        };

        let workspace = workspace.to_string_lossy();
        let mut wrapped: Vec<String> = TOOL_FLAGS
            .iter()
            .map(|flag| flag.replace("%WORKSPACE%", &workspace))
            .collect();
        wrapped.push("--".to_string());
        wrapped.push(program.to_string());
        wrapped.extend(args.iter().cloned());

        (tool.clone(), wrapped)
    }
}
