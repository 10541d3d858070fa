use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sandrun::config::{ByteSize, EngineConfig, MilliSecond, ToolchainConfig};
use sandrun::engine::Engine;
use sandrun::job::{Job, JobResult, RunRequest};
use sandrun::sandbox::{JobRunner, SandboxPrefix};
use sandrun::workspace::WorkspaceManager;

// Keeps the workspace root and the worker pool alive for one test
struct TestEngine {
    engine: Arc<Engine>,
    root: TempDir,
    _workers: JoinSet<()>,
}

impl TestEngine {
    fn start(timeout_ms: u64, max_output_bytes: u64, toolchains: ToolchainConfig) -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            concurrency_limit: 2,
            per_job_timeout_ms: MilliSecond(timeout_ms),
            max_output_bytes: ByteSize(max_output_bytes),
            workspace_root: Some(root.path().to_path_buf()),
            sandbox_prefix_enabled: false,
            legacy_compile_error_shape: false,
        };
        let (engine, workers) = Engine::start(
            &config,
            toolchains,
            SandboxPrefix::disabled(),
            CancellationToken::new(),
        )
        .unwrap();

        Self {
            engine: Arc::new(engine),
            root,
            _workers: workers,
        }
    }

    async fn run(&self, language: &str, code: &str, stdin: &str) -> JobResult {
        self.engine.submit(request(language, code, stdin)).await
    }

    fn assert_no_workspaces_left(&self) {
        let left: Vec<_> = fs::read_dir(self.root.path()).unwrap().collect();
        assert!(left.is_empty(), "workspaces left behind: {left:?}");
    }
}

fn request(language: &str, code: &str, stdin: &str) -> RunRequest {
    RunRequest {
        language: Some(language.to_string()),
        code: Some(code.to_string()),
        stdin: Some(stdin.to_string()),
    }
}

fn has_toolchain(binary: &str) -> bool {
    Command::new("which")
        .arg(binary)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn missing_toolchain(binaries: &[&str]) -> bool {
    match binaries.iter().find(|binary| !has_toolchain(binary)) {
        Some(binary) => {
            eprintln!("Skipping: {binary} is not installed");
            true
        }
        None => false,
    }
}

/// Toolchains where `python` is really `sh`, so scripts run anywhere
fn shell_toolchains() -> ToolchainConfig {
    ToolchainConfig {
        python: "sh".to_string(),
        ..ToolchainConfig::default()
    }
}

/// Writes an executable shell script standing in for a toolchain binary
fn fake_tool(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn completed(stdout: &str, stderr: &str, exit_code: Option<i32>) -> JobResult {
    JobResult::Completed {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

const HELLO_PROGRAMS: [(&str, &[&str], &str); 4] = [
    (
        "cpp",
        &["g++"],
        "#include <iostream>\nint main() { std::cout << \"Hello, World!\" << std::endl; return 0; }\n",
    ),
    (
        "java",
        &["javac", "java"],
        "public class Main { public static void main(String[] args) { System.out.println(\"Hello, World!\"); } }\n",
    ),
    ("python", &["python3"], "print(\"Hello, World!\")\n"),
    ("javascript", &["node"], "console.log(\"Hello, World!\");\n"),
];

const SQUARE_PROGRAMS: [(&str, &[&str], &str); 4] = [
    (
        "cpp",
        &["g++"],
        "#include <iostream>\nint main() { long long n; std::cin >> n; std::cout << n * n << std::endl; }\n",
    ),
    (
        "java",
        &["javac", "java"],
        "import java.util.Scanner;\npublic class Main { public static void main(String[] args) { Scanner s = new Scanner(System.in); long n = s.nextLong(); System.out.println(n * n); } }\n",
    ),
    ("python", &["python3"], "n = int(input())\nprint(n * n)\n"),
    (
        "javascript",
        &["node"],
        "const n = parseInt(require('fs').readFileSync(0, 'utf8').trim(), 10);\nconsole.log(n * n);\n",
    ),
];

#[tokio::test]
async fn test_hello_world_in_every_language() {
    let engine = TestEngine::start(30_000, 65536, ToolchainConfig::default());

    for (language, binaries, code) in HELLO_PROGRAMS {
        if missing_toolchain(binaries) {
            continue;
        }
        let result = engine.run(language, code, "").await;
        assert_eq!(result, completed("Hello, World!\n", "", Some(0)), "{language}");
    }

    engine.assert_no_workspaces_left();
}

#[tokio::test]
async fn test_square_from_stdin_in_every_language() {
    let engine = TestEngine::start(30_000, 65536, ToolchainConfig::default());

    for (language, binaries, code) in SQUARE_PROGRAMS {
        if missing_toolchain(binaries) {
            continue;
        }
        match engine.run(language, code, "5").await {
            JobResult::Completed {
                stdout, exit_code, ..
            } => {
                assert_eq!(stdout.trim(), "25", "{language}");
                assert_eq!(exit_code, Some(0), "{language}");
            }
            other => panic!("{language}: unexpected result {other:?}"),
        }
    }

    engine.assert_no_workspaces_left();
}

#[tokio::test]
async fn test_cpp_syntax_error_reports_compiler_diagnostics() {
    if missing_toolchain(&["g++"]) {
        return;
    }
    let engine = TestEngine::start(30_000, 65536, ToolchainConfig::default());
    let code = "#include <iostream>\nint main() { std::cout << \"x\" << std::endl\n return 0; }\n";

    let result = engine.run("cpp", code, "").await;
    let JobResult::CompileError { message } = result else {
        panic!("expected a compile error, got {result:?}");
    };
    assert!(!message.is_empty());

    // Same invocation by hand must print the same diagnostics
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.cpp"), code).unwrap();
    let output = Command::new("g++")
        .args(["-O2", "-std=c++17", "-o", "main", "main.cpp"])
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert_eq!(message, String::from_utf8_lossy(&output.stderr));

    engine.assert_no_workspaces_left();
}

#[tokio::test]
async fn test_timeout_kills_program() {
    let engine = TestEngine::start(500, 65536, shell_toolchains());
    let scratch = tempfile::tempdir().unwrap();
    let pid_file = scratch.path().join("pid");

    let code = format!("echo $$ > {}; exec sleep 30", pid_file.display());
    let result = engine.run("python", &code, "").await;

    assert_eq!(
        result,
        JobResult::RunError {
            message: "Execution timed out".to_string()
        }
    );
    let pid = fs::read_to_string(&pid_file).unwrap();
    assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
    engine.assert_no_workspaces_left();
}

#[tokio::test]
async fn test_runaway_output_is_capped() {
    let engine = TestEngine::start(10_000, 1000, shell_toolchains());

    let result = engine.run("python", "yes", "").await;
    let JobResult::Completed {
        stdout, exit_code, ..
    } = result
    else {
        panic!("expected a completed run, got {result:?}");
    };
    assert_eq!(stdout.len(), 1000);
    assert_eq!(exit_code, None);
    engine.assert_no_workspaces_left();
}

#[tokio::test]
async fn test_nonzero_exit_is_a_completion() {
    let engine = TestEngine::start(10_000, 65536, shell_toolchains());

    let result = engine
        .run("python", "read line; echo \"got $line\"; echo err >&2; exit 7", "abc\n")
        .await;
    assert_eq!(result, completed("got abc\n", "err\n", Some(7)));
    engine.assert_no_workspaces_left();
}

#[tokio::test]
async fn test_compile_error_message_fallbacks() {
    // The fake compiler runs the submitted source as a shell script
    let tools = tempfile::tempdir().unwrap();
    let toolchains = ToolchainConfig {
        java_compiler: fake_tool(tools.path(), "javac", "exec sh \"$1\""),
        ..ToolchainConfig::default()
    };
    let engine = TestEngine::start(10_000, 65536, toolchains);

    let cases = [
        ("echo 'Main.java:1: error' >&2; echo noise; exit 1", "Main.java:1: error\n"),
        ("echo only-stdout; exit 2", "only-stdout\n"),
        ("exit 1", "Compilation error"),
    ];
    for (code, expected) in cases {
        let result = engine.run("java", code, "").await;
        assert_eq!(
            result,
            JobResult::CompileError {
                message: expected.to_string()
            }
        );
    }
    engine.assert_no_workspaces_left();
}

#[tokio::test]
async fn test_compile_timeout() {
    let tools = tempfile::tempdir().unwrap();
    let toolchains = ToolchainConfig {
        java_compiler: fake_tool(tools.path(), "javac", "exec sleep 30"),
        ..ToolchainConfig::default()
    };
    let engine = TestEngine::start(400, 65536, toolchains);

    let result = engine.run("java", "class Main {}", "").await;
    assert_eq!(
        result,
        JobResult::CompileError {
            message: "Compilation timed out".to_string()
        }
    );
    engine.assert_no_workspaces_left();
}

#[tokio::test]
async fn test_each_stage_gets_its_own_timeout() {
    let tools = tempfile::tempdir().unwrap();
    let toolchains = ToolchainConfig {
        java_compiler: fake_tool(tools.path(), "javac", "sleep 0.6"),
        java_runtime: fake_tool(tools.path(), "java", "sleep 0.6; echo ran"),
        ..ToolchainConfig::default()
    };
    // Both stages together exceed the budget, each one alone does not
    let engine = TestEngine::start(1000, 65536, toolchains);

    let result = engine.run("java", "class Main {}", "").await;
    assert_eq!(result, completed("ran\n", "", Some(0)));
}

#[tokio::test]
async fn test_missing_compiler_is_a_compile_error() {
    let toolchains = ToolchainConfig {
        cpp_compiler: "/nonexistent/sandrun-gxx".to_string(),
        ..ToolchainConfig::default()
    };
    let engine = TestEngine::start(10_000, 65536, toolchains);

    let result = engine.run("cpp", "int main() {}", "").await;
    let JobResult::CompileError { message } = result else {
        panic!("expected a compile error, got {result:?}");
    };
    assert!(message.contains("Failed to start /nonexistent/sandrun-gxx"));
    engine.assert_no_workspaces_left();
}

#[tokio::test]
async fn test_missing_binary_is_a_run_error() {
    // "Compiles" successfully without producing ./main
    let toolchains = ToolchainConfig {
        cpp_compiler: "true".to_string(),
        ..ToolchainConfig::default()
    };
    let engine = TestEngine::start(10_000, 65536, toolchains);

    let result = engine.run("cpp", "int main() {}", "").await;
    let JobResult::RunError { message } = result else {
        panic!("expected a run error, got {result:?}");
    };
    assert!(message.contains("Failed to start ./main"));
    engine.assert_no_workspaces_left();
}

#[tokio::test]
async fn test_rejected_before_any_workspace_is_created() {
    let engine = TestEngine::start(10_000, 65536, shell_toolchains());

    assert_eq!(
        engine.run("ruby", "puts 1", "").await,
        JobResult::Rejected {
            reason: "Unsupported language: ruby".to_string()
        }
    );
    assert_eq!(
        engine
            .engine
            .submit(RunRequest {
                language: Some("python".to_string()),
                ..RunRequest::default()
            })
            .await,
        JobResult::Rejected {
            reason: "Missing code".to_string()
        }
    );
    engine.assert_no_workspaces_left();
}

// Records how many jobs are inside `run` at the same time
#[derive(Default)]
struct CountingRunner {
    active: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl JobRunner for CountingRunner {
    async fn run(&self, job: Job) -> JobResult {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        let stdout = job.request.source_code.clone();
        job.workspace.release().await;
        completed(&stdout, "", Some(0))
    }
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    const LIMIT: usize = 2;
    const JOBS: usize = LIMIT + 3;

    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(CountingRunner::default());
    let (engine, _workers) = Engine::with_runner(
        WorkspaceManager::new(root.path()).unwrap(),
        runner.clone(),
        LIMIT,
        CancellationToken::new(),
    );
    let engine = Arc::new(engine);

    let mut submissions = JoinSet::new();
    for i in 0..JOBS {
        let engine = engine.clone();
        submissions.spawn(async move { (i, engine.submit(request("python", &format!("job {i}"), "")).await) });
    }

    while !submissions.is_empty() {
        assert!(engine.queue().running() <= LIMIT);
        tokio::time::sleep(Duration::from_millis(10)).await;
        while let Some(joined) = submissions.try_join_next() {
            let (i, result) = joined.unwrap();
            assert_eq!(result, completed(&format!("job {i}"), "", Some(0)));
        }
    }

    assert_eq!(runner.finished.load(Ordering::SeqCst), JOBS);
    assert!(runner.peak.load(Ordering::SeqCst) <= LIMIT);
    assert_eq!(engine.queue().running(), 0);
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
}

struct PanickyRunner;

impl JobRunner for PanickyRunner {
    async fn run(&self, job: Job) -> JobResult {
        if job.request.source_code == "panic" {
            panic!("runner blew up");
        }
        job.workspace.release().await;
        completed("fine", "", Some(0))
    }
}

#[tokio::test]
async fn test_panicking_job_is_isolated() {
    let root = tempfile::tempdir().unwrap();
    let (engine, _workers) = Engine::with_runner(
        WorkspaceManager::new(root.path()).unwrap(),
        Arc::new(PanickyRunner),
        1,
        CancellationToken::new(),
    );

    assert_eq!(
        engine.submit(request("python", "panic", "")).await,
        JobResult::internal()
    );
    // The single worker survived and the crashed job's workspace is gone
    assert_eq!(
        engine.submit(request("python", "print(1)", "")).await,
        completed("fine", "", Some(0))
    );
    let left: Vec<PathBuf> = fs::read_dir(root.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert!(left.is_empty(), "workspaces left behind: {left:?}");
}
