use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Marker preceding the result JSON on the child's stdout. The JSON object
/// follows on the same line with no delimiter.
pub const SENTINEL: &str = "__SANDBOX_RESULT__";

pub const PROGRAM_FILE: &str = "main.py";
pub const HELPER_MODULE_FILE: &str = "toolrun_bridge.py";

/// Prefix the `call` subcommand puts on its stderr error line.
pub const BRIDGE_ERROR_PREFIX: &str = "toolrun-error: ";

pub const ENV_BRIDGE_BIN: &str = "TOOLRUN_BRIDGE_BIN";
pub const ENV_USER_ID: &str = "TOOLRUN_USER_ID";
pub const ENV_REQUEST_ID: &str = "TOOLRUN_REQUEST_ID";

const BODY_PLACEHOLDER: &str = "__TOOLRUN_BODY__";
const SENTINEL_PLACEHOLDER: &str = "__TOOLRUN_SENTINEL__";

const PROGRAM_TEMPLATE: &str = r#"import asyncio
import json
import sys

from toolrun_bridge import Bridge

_SENTINEL = "__TOOLRUN_SENTINEL__"


async def __toolrun_entry(bridge):
__TOOLRUN_BODY__


def _emit(payload):
    try:
        encoded = json.dumps(payload, default=str)
    except (TypeError, ValueError) as exc:
        encoded = json.dumps({"error": f"result is not JSON serializable: {exc}"})
    sys.stdout.flush()
    sys.stdout.write(_SENTINEL + encoded + "\n")
    sys.stdout.flush()


def _main():
    bridge = Bridge.from_env()
    try:
        result = asyncio.run(__toolrun_entry(bridge))
    except BaseException as exc:
        _emit({"error": f"{type(exc).__name__}: {exc}"})
        raise
    _emit({"result": result})


if __name__ == "__main__":
    _main()
"#;

/// Helper package imported by every generated program. The bridge handle is
/// built once at process start and passed to the entry function.
pub const HELPER_SOURCE: &str = r#""""Tool-call bridge for sandboxed programs."""
import asyncio
import json
import os
import subprocess
import sys

_ERROR_PREFIX = "toolrun-error: "


class ToolCallError(RuntimeError):
    pass


class Bridge:
    def __init__(self, executable=None, user_id=None, request_id=None):
        self.executable = executable
        self.user_id = user_id
        self.request_id = request_id

    @classmethod
    def from_env(cls):
        return cls(
            os.environ.get("TOOLRUN_BRIDGE_BIN") or None,
            os.environ.get("TOOLRUN_USER_ID") or None,
            os.environ.get("TOOLRUN_REQUEST_ID") or None,
        )

    def call_sync(self, provider, tool, payload=None):
        if not self.executable:
            raise ToolCallError("tool bridge is not configured (TOOLRUN_BRIDGE_BIN is unset)")
        args = [self.executable, "call", provider, tool]
        if self.user_id:
            args += ["--user-id", self.user_id]
        if self.request_id:
            args += ["--request-id", self.request_id]
        proc = subprocess.run(
            args,
            input=json.dumps(payload or {}),
            capture_output=True,
            text=True,
        )
        if proc.stderr:
            sys.stderr.write(proc.stderr)
            sys.stderr.flush()
        if proc.returncode != 0:
            lines = [line for line in proc.stderr.splitlines() if line.strip()]
            errors = [line[len(_ERROR_PREFIX):] for line in lines if line.startswith(_ERROR_PREFIX)]
            if errors:
                raise ToolCallError(errors[-1])
            if lines:
                raise ToolCallError(lines[-1])
            raise ToolCallError(f"{provider}.{tool} exited with status {proc.returncode}")
        return json.loads(proc.stdout)

    async def call(self, provider, tool, payload=None):
        loop = asyncio.get_running_loop()
        return await loop.run_in_executor(None, self.call_sync, provider, tool, payload)
"#;

/// Wraps a code body into the complete sandbox program.
pub fn build_program(code: &str) -> String {
    let body = indent_body(code);
    PROGRAM_TEMPLATE
        .replace(SENTINEL_PLACEHOLDER, SENTINEL)
        .replace(BODY_PLACEHOLDER, &body)
}

fn indent_body(code: &str) -> String {
    let dedented = dedent(code);
    if dedented.trim().is_empty() {
        return "    return None".to_string();
    }
    dedented
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("    {}", line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Removes the whitespace prefix shared by every non-blank line.
pub fn dedent(code: &str) -> String {
    let margin = code
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    code.lines()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                line.get(margin..).unwrap_or_else(|| line.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Writes the helper module under `root`, replacing it only when the contents differ.
pub fn install_helper(root: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(root)?;
    let target = root.join(HELPER_MODULE_FILE);
    if let Ok(existing) = fs::read_to_string(&target) {
        if existing == HELPER_SOURCE {
            return Ok(target);
        }
    }

    debug!("Installing sandbox helper module at {}", target.display());
    let mut staged = tempfile::NamedTempFile::new_in(root)?;
    staged.write_all(HELPER_SOURCE.as_bytes())?;
    staged.flush()?;
    staged.persist(&target).map_err(|e| e.error)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_embeds_indented_body_and_sentinel() {
        let program = build_program("x = 1\nreturn {'x': x}");
        let expected = "async def __toolrun_entry(bridge):\n    x = 1\n    return {'x': x}\n";
        assert!(program.contains(expected));
        assert!(program.contains(&format!("_SENTINEL = \"{}\"", SENTINEL)));
        assert!(program.contains("from toolrun_bridge import Bridge"));
        assert!(!program.contains(BODY_PLACEHOLDER));
    }

    #[test]
    fn empty_body_returns_none() {
        let program = build_program("  \n");
        assert!(program.contains("async def __toolrun_entry(bridge):\n    return None\n"));
    }

    #[test]
    fn dedent_strips_common_margin_only() {
        let code = "    if a:\n        b()\n\n    c()";
        assert_eq!(dedent(code), "if a:\n    b()\n\nc()");
        assert_eq!(dedent("a\n  b"), "a\n  b");
    }

    #[test]
    fn helper_install_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let first = install_helper(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&first).unwrap(), HELPER_SOURCE);

        std::fs::write(&first, "stale").unwrap();
        let second = install_helper(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&second).unwrap(), HELPER_SOURCE);
    }
}
