use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{Result, SandboxError};
use super::harness::{
    build_program, install_helper, ENV_BRIDGE_BIN, ENV_REQUEST_ID, ENV_USER_ID, PROGRAM_FILE,
};
use super::outcome::{SandboxResult, SandboxState};
use crate::shared::config::default_helper_root;
use crate::shared::telemetry::{with_timestamp, TelemetrySink, TracingTelemetry, SANDBOX_RUN};
use crate::tools::summary::sanitize_label;

const SEARCH_PATH_VAR: &str = "PYTHONPATH";
const INTERPRETER_CANDIDATES: [&str; 2] = ["python3", "python"];
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Explicit interpreter; otherwise `python3`/`python` is looked up on `PATH`.
    pub interpreter: Option<PathBuf>,
    pub timeout: Duration,
    pub helper_root: PathBuf,
    pub toolbox_root: Option<PathBuf>,
    pub bridge_executable: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            timeout: Duration::from_secs(30),
            helper_root: default_helper_root(),
            toolbox_root: None,
            bridge_executable: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub label: String,
    pub code: String,
    pub user_id: Option<String>,
    pub request_id: String,
    pub timeout: Option<Duration>,
}

impl SandboxRequest {
    pub fn new(label: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            code: code.into(),
            user_id: None,
            request_id: Uuid::new_v4().to_string(),
            timeout: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Runs planner code in a fresh child interpreter, one process per call.
pub struct SandboxRunner {
    config: SandboxConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Only infrastructure failures are returned as `Err`; every execution
    /// failure (timeout, crash, bad output) is a failed [`SandboxResult`].
    pub async fn run(&self, request: &SandboxRequest) -> Result<SandboxResult> {
        let started = Instant::now();
        debug!(label = %request.label, state = ?SandboxState::Building, "Preparing sandbox");

        let interpreter = self.resolve_interpreter()?;
        install_helper(&self.config.helper_root).map_err(|source| SandboxError::HelperInstall {
            path: self.config.helper_root.clone(),
            source,
        })?;
        let search_path = self.search_path()?;

        let owner = sanitize_label(request.user_id.as_deref().unwrap_or("anonymous"));
        let workspace = tempfile::Builder::new()
            .prefix(&format!("sandbox-{}-", owner))
            .tempdir()?;
        let program_path = workspace.path().join(PROGRAM_FILE);
        std::fs::write(&program_path, build_program(&request.code))?;

        let timeout = request.timeout.unwrap_or(self.config.timeout);
        debug!(label = %request.label, state = ?SandboxState::Running, "Launching sandbox process");
        let result = self
            .execute(
                &interpreter,
                workspace.path(),
                &program_path,
                &search_path,
                request,
                timeout,
            )
            .await;

        if let Err(e) = workspace.close() {
            warn!("Failed to remove sandbox workspace: {}", e);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            label = %request.label,
            state = ?result.state(),
            "Sandbox finished in {}ms",
            duration_ms
        );
        self.emit_run(request, &result, duration_ms);
        Ok(result)
    }

    async fn execute(
        &self,
        interpreter: &Path,
        workdir: &Path,
        program: &Path,
        search_path: &OsString,
        request: &SandboxRequest,
        timeout: Duration,
    ) -> SandboxResult {
        let mut command = Command::new(interpreter);
        command
            .arg(program)
            .current_dir(workdir)
            .env(SEARCH_PATH_VAR, search_path)
            .env("PYTHONUNBUFFERED", "1")
            .env(ENV_REQUEST_ID, &request.request_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &request.user_id {
            Some(user_id) => command.env(ENV_USER_ID, user_id),
            None => command.env_remove(ENV_USER_ID),
        };
        match &self.config.bridge_executable {
            Some(bridge) => command.env(ENV_BRIDGE_BIN, bridge),
            None => command.env_remove(ENV_BRIDGE_BIN),
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn sandbox process: {}", e);
                return SandboxResult::failed(
                    format!("Failed to start sandbox process: {}", e),
                    Vec::new(),
                );
            }
        };

        let (stdout_buf, stdout_task) = capture(child.stdout.take());
        let (stderr_buf, stderr_task) = capture(child.stderr.take());

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                drain([stdout_task, stderr_task]).await;
                SandboxResult::from_exit(
                    &snapshot(&stdout_buf),
                    &snapshot(&stderr_buf),
                    status.code(),
                )
            }
            Ok(Err(e)) => {
                drain([stdout_task, stderr_task]).await;
                let logs = snapshot(&stderr_buf).lines().map(|l| l.to_string()).collect();
                SandboxResult::failed(format!("Failed to wait for sandbox process: {}", e), logs)
            }
            Err(_) => {
                warn!(label = %request.label, "Sandbox exceeded {:?}, killing process", timeout);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out sandbox process: {}", e);
                }
                drain([stdout_task, stderr_task]).await;
                SandboxResult::timed_out(timeout, &snapshot(&stdout_buf), &snapshot(&stderr_buf))
            }
        }
    }

    fn resolve_interpreter(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.interpreter {
            if path.is_file() {
                return Ok(path.clone());
            }
            if path.components().count() == 1 {
                if let Some(found) = find_in_path(&path.to_string_lossy()) {
                    return Ok(found);
                }
            }
            return Err(SandboxError::InterpreterNotFound(path.display().to_string()));
        }

        INTERPRETER_CANDIDATES
            .iter()
            .find_map(|name| find_in_path(name))
            .ok_or_else(|| {
                SandboxError::InterpreterNotFound(format!(
                    "none of {} found on PATH",
                    INTERPRETER_CANDIDATES.join(", ")
                ))
            })
    }

    /// Helper root, then toolbox root, then the inherited search path.
    fn search_path(&self) -> Result<OsString> {
        let mut entries = vec![self.config.helper_root.clone()];
        if let Some(toolbox) = &self.config.toolbox_root {
            entries.push(toolbox.clone());
        }
        if let Some(existing) = std::env::var_os(SEARCH_PATH_VAR) {
            entries.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(entries).map_err(|e| SandboxError::Configuration(e.to_string()))
    }

    fn emit_run(&self, request: &SandboxRequest, result: &SandboxResult, duration_ms: u64) {
        let data = json!({
            "label": request.label,
            "user_id": request.user_id,
            "request_id": request.request_id,
            "success": result.success,
            "timed_out": result.timed_out,
            "error": result.error,
            "log_lines": result.logs.len(),
            "duration_ms": duration_ms,
        });
        if let serde_json::Value::Object(map) = data {
            self.telemetry.emit(SANDBOX_RUN, with_timestamp(map));
        }
    }
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Copies a child stream into a shared buffer so partial output survives a kill.
fn capture<R>(stream: Option<R>) -> (SharedBuffer, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
    let sink = buffer.clone();
    let handle = tokio::spawn(async move {
        let Some(mut reader) = stream else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => match sink.lock() {
                    Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                    Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                },
            }
        }
    });
    (buffer, handle)
}

/// Waits a bounded time for the readers; a grandchild holding a pipe open must
/// not stall the caller.
async fn drain(handles: [JoinHandle<()>; 2]) {
    for handle in handles {
        let abort = handle.abort_handle();
        if tokio::time::timeout(READER_GRACE, handle).await.is_err() {
            abort.abort();
        }
    }
}

fn snapshot(buffer: &SharedBuffer) -> String {
    let bytes = match buffer.lock() {
        Ok(buf) => buf.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::telemetry::RecordingTelemetry;

    fn python() -> Option<PathBuf> {
        INTERPRETER_CANDIDATES.iter().find_map(|name| find_in_path(name))
    }

    fn runner(helper_root: &Path, timeout: Duration) -> Option<SandboxRunner> {
        let interpreter = python()?;
        Some(SandboxRunner::new(SandboxConfig {
            interpreter: Some(interpreter),
            timeout,
            helper_root: helper_root.to_path_buf(),
            toolbox_root: None,
            bridge_executable: None,
        }))
    }

    #[tokio::test]
    async fn missing_interpreter_is_an_error() {
        let helpers = tempfile::tempdir().unwrap();
        let runner = SandboxRunner::new(SandboxConfig {
            interpreter: Some(PathBuf::from("/nonexistent/bin/python3")),
            helper_root: helpers.path().to_path_buf(),
            ..SandboxConfig::default()
        });
        let err = runner
            .run(&SandboxRequest::new("t", "return 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InterpreterNotFound(_)));
    }

    #[tokio::test]
    async fn returns_result_and_logs() {
        let helpers = tempfile::tempdir().unwrap();
        let Some(runner) = runner(helpers.path(), Duration::from_secs(20)) else {
            return;
        };
        let telemetry = Arc::new(RecordingTelemetry::new());
        let runner = runner.with_telemetry(telemetry.clone());

        let code = "print('fetching')\n\
                    import sys\n\
                    print('note', file=sys.stderr)\n\
                    return {'n': 41 + 1}";
        let result = runner.run(&SandboxRequest::new("calc", code)).await.unwrap();

        assert!(result.success, "{:?}", result);
        assert_eq!(result.result.unwrap()["n"], json!(42));
        assert!(result.logs.contains(&"fetching".to_string()));
        assert!(result.logs.contains(&"note".to_string()));

        let runs = telemetry.named(SANDBOX_RUN);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["label"], json!("calc"));
        assert_eq!(runs[0]["success"], json!(true));
    }

    #[tokio::test]
    async fn raised_exception_becomes_failed_result() {
        let helpers = tempfile::tempdir().unwrap();
        let Some(runner) = runner(helpers.path(), Duration::from_secs(20)) else {
            return;
        };
        let result = runner
            .run(&SandboxRequest::new("err", "raise ValueError('bad input')"))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(!result.timed_out);
        assert_eq!(result.error.as_deref(), Some("ValueError: bad input"));
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let helpers = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let Some(runner) = runner(helpers.path(), Duration::from_secs(1)) else {
            return;
        };
        let pid_file = scratch.path().join("pid");
        let code = format!(
            "import os, time\n\
             open({:?}, 'w').write(str(os.getpid()))\n\
             print('sleeping', flush=True)\n\
             time.sleep(30)",
            pid_file.display().to_string()
        );

        let started = Instant::now();
        let result = runner.run(&SandboxRequest::new("slow", code)).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(15));
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.error.as_deref(), Some("Timeout after 1s"));
        assert!(result.logs.contains(&"sleeping".to_string()));

        #[cfg(target_os = "linux")]
        if let Ok(pid) = std::fs::read_to_string(&pid_file) {
            assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
        }
    }

    #[tokio::test]
    async fn crash_without_sentinel_reports_stderr() {
        let helpers = tempfile::tempdir().unwrap();
        let Some(runner) = runner(helpers.path(), Duration::from_secs(20)) else {
            return;
        };
        let code = "import os, sys\n\
                    sys.stderr.write('fatal: interpreter gone\\n')\n\
                    sys.stderr.flush()\n\
                    os._exit(3)";
        let result = runner.run(&SandboxRequest::new("crash", code)).await.unwrap();
        assert!(!result.success);
        assert!(!result.timed_out);
        assert_eq!(result.error.as_deref(), Some("fatal: interpreter gone"));
    }

    #[tokio::test]
    async fn child_sees_identity_and_an_isolated_workspace() {
        let helpers = tempfile::tempdir().unwrap();
        let Some(runner) = runner(helpers.path(), Duration::from_secs(20)) else {
            return;
        };
        let code = "import os\n\
                    return {'user': os.environ.get('TOOLRUN_USER_ID'), \
                    'request': os.environ.get('TOOLRUN_REQUEST_ID'), \
                    'files': sorted(os.listdir('.')), 'cwd': os.getcwd()}";
        let request = SandboxRequest::new("env", code)
            .with_user_id("u-42")
            .with_request_id("req-1");
        let result = runner.run(&request).await.unwrap();

        let data = result.result.unwrap();
        assert_eq!(data["user"], json!("u-42"));
        assert_eq!(data["request"], json!("req-1"));
        assert_eq!(data["files"], json!([PROGRAM_FILE]));
        let cwd = data["cwd"].as_str().unwrap();
        assert!(cwd.contains("sandbox-u-42-"));
        assert!(!Path::new(cwd).exists());
    }

    #[tokio::test]
    async fn toolbox_root_is_importable() {
        let helpers = tempfile::tempdir().unwrap();
        let toolbox = tempfile::tempdir().unwrap();
        std::fs::write(toolbox.path().join("crm_helpers.py"), "VALUE = 'from toolbox'\n").unwrap();
        let Some(mut runner) = runner(helpers.path(), Duration::from_secs(20)) else {
            return;
        };
        runner.config.toolbox_root = Some(toolbox.path().to_path_buf());

        let code = "import crm_helpers\nreturn {'v': crm_helpers.VALUE}";
        let result = runner
            .run(&SandboxRequest::new("toolbox", code))
            .await
            .unwrap();
        assert_eq!(result.result.unwrap()["v"], json!("from toolbox"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bridge_output_and_identity_reach_the_result() {
        use std::os::unix::fs::PermissionsExt;

        let helpers = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let bridge = scratch.path().join("fake-bridge");
        std::fs::write(
            &bridge,
            "#!/bin/sh\n\
             echo \"args: $*\" >&2\n\
             cat > /dev/null\n\
             echo '{\"successful\": true, \"data\": {\"ok\": true}, \"error\": null}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&bridge, std::fs::Permissions::from_mode(0o755)).unwrap();

        let Some(mut runner) = runner(helpers.path(), Duration::from_secs(20)) else {
            return;
        };
        runner.config.bridge_executable = Some(bridge);

        let code = "resp = await bridge.call('slack', 'SLACK_SEND_MESSAGE', {'channel': 'C1'})\n\
                    return resp['data']";
        let request = SandboxRequest::new("bridge", code)
            .with_user_id("u-1")
            .with_request_id("req-5");
        let result = runner.run(&request).await.unwrap();

        assert!(result.success, "{:?}", result);
        assert_eq!(result.result.unwrap()["ok"], json!(true));
        let expected = "args: call slack SLACK_SEND_MESSAGE --user-id u-1 --request-id req-5";
        assert!(result.logs.contains(&expected.to_string()));
    }

    #[tokio::test]
    async fn unconfigured_bridge_raises_inside_child() {
        let helpers = tempfile::tempdir().unwrap();
        let Some(runner) = runner(helpers.path(), Duration::from_secs(20)) else {
            return;
        };
        let code = "resp = await bridge.call('slack', 'SLACK_SEND_MESSAGE', {'channel': 'C1'})\n\
                    return resp";
        let result = runner.run(&SandboxRequest::new("bridge", code)).await.unwrap();
        assert!(!result.success);
        assert!(result
            .error
            .unwrap()
            .starts_with("ToolCallError: tool bridge is not configured"));
    }
}
