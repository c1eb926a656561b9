//! Shell command execution tool.

use crate::error::ToolError;
use crate::model::Tool;
use crate::tooling::{CallableTool, ToolOk, ToolOutcome};
use serde_json::json;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Runs a shell command (`sh -c` on Unix, `powershell -Command` on Windows)
/// and returns its combined stdout/stderr.
#[derive(Clone)]
pub struct ShellTool {
    timeout_secs: u64,
    working_dir: Option<std::path::PathBuf>,
}

impl ShellTool {
    pub fn new() -> Self {
        Self {
            timeout_secs: 30,
            working_dir: None,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_working_dir(mut self, dir: std::path::PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn error_context(&self, command: &str) -> String {
        let shell = if cfg!(target_os = "windows") {
            "powershell"
        } else {
            "sh"
        };
        let cwd = if let Some(dir) = &self.working_dir {
            dir.display().to_string()
        } else {
            std::env::current_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|_| "(unknown)".to_string())
        };
        format!("shell={}\ncwd={}\ncommand={}", shell, cwd, command)
    }

    fn combine_output(stdout: &str, stderr: &str) -> String {
        let mut result = String::new();
        if !stdout.is_empty() {
            result.push_str(stdout);
        }
        if !stderr.is_empty() {
            if !result.is_empty() {
                result.push_str("\n---STDERR---\n");
            }
            result.push_str(stderr);
        }
        result
    }

    async fn run(&self, command: &str) -> Result<String, String> {
        if command.trim().is_empty() {
            return Err(format!("Command cannot be empty\n{}", self.error_context(command)));
        }

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("powershell");
            c.args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("Failed to spawn command: {}\n{}", e, self.error_context(command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| format!("Failed to capture stdout\n{}", self.error_context(command)))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| format!("Failed to capture stderr\n{}", self.error_context(command)))?;

        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            tokio::io::BufReader::new(stdout)
                .read_to_end(&mut buf)
                .await
                .map(|_| buf)
                .map_err(|e| e.to_string())
        });
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            tokio::io::BufReader::new(stderr)
                .read_to_end(&mut buf)
                .await
                .map(|_| buf)
                .map_err(|e| e.to_string())
        });

        let timeout = Duration::from_secs(self.timeout_secs);
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => {
                result.map_err(|e| format!("Command execution failed: {}\n{}", e, self.error_context(command)))?
            }
            Err(_) => {
                let kill_result = match child.kill().await {
                    Ok(_) => "killed".to_string(),
                    Err(e) => format!("kill failed: {}", e),
                };
                let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;

                let stdout_text = match stdout_handle.await {
                    Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).to_string(),
                    Ok(Err(e)) => format!("(failed to read stdout: {})", e),
                    Err(e) => format!("(failed to join stdout reader: {})", e),
                };
                let stderr_text = match stderr_handle.await {
                    Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).to_string(),
                    Ok(Err(e)) => format!("(failed to read stderr: {})", e),
                    Err(e) => format!("(failed to join stderr reader: {})", e),
                };
                let output = Self::combine_output(&stdout_text, &stderr_text);
                return Err(format!(
                    "Command timed out after {} seconds (kill: {})\n{}\n{}",
                    self.timeout_secs,
                    kill_result,
                    if output.is_empty() { "(no output)".to_string() } else { output },
                    self.error_context(command)
                ));
            }
        };

        let stdout_bytes = stdout_handle
            .await
            .map_err(|e| format!("Failed to join stdout reader: {}\n{}", e, self.error_context(command)))?
            .map_err(|e| format!("Failed to read stdout: {}\n{}", e, self.error_context(command)))?;
        let stderr_bytes = stderr_handle
            .await
            .map_err(|e| format!("Failed to join stderr reader: {}\n{}", e, self.error_context(command)))?
            .map_err(|e| format!("Failed to read stderr: {}\n{}", e, self.error_context(command)))?;

        let stdout = String::from_utf8_lossy(&stdout_bytes);
        let stderr = String::from_utf8_lossy(&stderr_bytes);
        let result = Self::combine_output(&stdout, &stderr);

        if status.success() {
            Ok(if result.is_empty() {
                "(Command completed successfully with no output)".to_string()
            } else {
                result
            })
        } else {
            let exit_code = status.code().unwrap_or(-1);
            Err(format!(
                "Command failed with exit code {}\n{}\n{}",
                exit_code,
                if result.is_empty() { "(no output)".to_string() } else { result },
                self.error_context(command)
            ))
        }
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CallableTool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its combined stdout/stderr."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute."
                }
            },
            "required": ["command"]
        })
    }

    fn as_tool(&self) -> Tool {
        let os = std::env::consts::OS;
        let (shell_name, rules, examples) = match os {
            "windows" => (
                "PowerShell",
                "On Windows, you MUST generate PowerShell commands. \
                 DO NOT use bash syntax or Unix utilities (ls, grep, awk, sed, cat, rm, etc.).",
                r#"Examples:
    - List files: Get-ChildItem
    - Read file: Get-Content file.txt
    - Search text: Select-String "foo" file.txt"#,
            ),
            _ => (
                "bash",
                "On Linux/macOS, you MUST generate bash-compatible shell commands.",
                r#"Examples:
    - List files: ls
    - Read file: cat file.txt
    - Search text: grep foo file.txt"#,
            ),
        };
        let description = format!(
            "Execute a shell command and return the output.\n{rules}\nCurrent OS: {os}\nShell: {shell_name}\n{examples}"
        );
        Tool {
            name: self.name().to_string(),
            description,
            parameters: self.parameters(),
        }
    }

    async fn call(&self, arguments: serde_json::Value) -> ToolOutcome {
        let command = arguments
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::runtime("missing 'command' argument"))?;

        self.run(command).await.map(ToolOk::new).map_err(ToolError::runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_simple_command() {
        let tool = ShellTool::new();
        let outcome = tool.call(json!({"command": "echo hello"})).await.unwrap();
        assert!(outcome.output.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_runtime_error() {
        let tool = ShellTool::new();
        let err = tool.call(json!({"command": "exit 1"})).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ToolErrorKind::Runtime);
    }

    #[tokio::test]
    async fn timeout_is_a_runtime_error() {
        let tool = ShellTool::new().with_timeout(1);
        let command = if cfg!(target_os = "windows") {
            "timeout /t 5"
        } else {
            "sleep 5"
        };
        let err = tool.call(json!({"command": command})).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ToolErrorKind::Runtime);
    }

    #[test]
    fn as_tool_carries_os_specific_description() {
        let tool = ShellTool::new();
        let t = tool.as_tool();
        assert_eq!(t.name, "shell");
        assert!(t.description.contains("Execute"));
    }
}
