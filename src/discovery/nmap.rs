//! nmap subprocess driver

use crate::config::NmapSettings;
use crate::{WatchError, WatchResult};
use log::{debug, info, warn};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// nmap integration engine
pub struct NmapEngine {
    settings: NmapSettings,
}

/// Captured result of a finished nmap process
#[derive(Debug, Clone, Default)]
pub struct NmapOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl NmapEngine {
    pub fn new(settings: NmapSettings) -> Self {
        Self { settings }
    }

    /// Full argument vector: user flags (or the defaults), progress flags
    /// for streamed runs, then the target ranges.
    pub fn build_args(&self, targets: &[String], extra_args: Option<&str>, streaming: bool) -> Vec<String> {
        let mut args: Vec<String> = match extra_args.map(str::trim).filter(|a| !a.is_empty()) {
            Some(custom) => custom.split_whitespace().map(String::from).collect(),
            None => self.settings.default_args.clone(),
        };

        if streaming {
            let progress = &self.settings.progress_args;
            let mut i = 0;
            while i < progress.len() {
                let flag = &progress[i];
                let value = progress.get(i + 1).filter(|v| !v.starts_with('-'));
                if !args.contains(flag) {
                    args.push(flag.clone());
                    args.extend(value.cloned());
                }
                i += if value.is_some() { 2 } else { 1 };
            }
        }

        args.extend(targets.iter().cloned());
        args
    }

    /// Run to completion and capture everything
    pub async fn run(&self, targets: &[String], extra_args: Option<&str>) -> WatchResult<NmapOutput> {
        let args = self.build_args(targets, extra_args, false);
        info!("Running {} {}", self.settings.binary, args.join(" "));

        let output = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(&self.settings.binary, e))?;

        let result = NmapOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };

        check_exit(output.status.success(), result)
    }

    /// Run while handing each output line to `on_line` as it arrives.
    ///
    /// stderr is drained concurrently so a chatty nmap never blocks on a full
    /// pipe; its lines are passed to `on_line` too, after stdout finishes.
    pub async fn run_streaming<F>(
        &self,
        targets: &[String],
        extra_args: Option<&str>,
        mut on_line: F,
    ) -> WatchResult<NmapOutput>
    where
        F: FnMut(&str),
    {
        let args = self.build_args(targets, extra_args, true);
        info!("Running {} {}", self.settings.binary, args.join(" "));

        let mut child = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.settings.binary, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WatchError::ProcessExecution { code: None, message: "Failed to capture stdout".to_string() })?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| WatchError::ProcessExecution { code: None, message: "Failed to capture stderr".to_string() })?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Err(e) = stderr.read_to_string(&mut buf).await {
                warn!("Failed to read nmap stderr: {}", e);
            }
            buf
        });

        let mut collected = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            on_line(&line);
            collected.push_str(&line);
            collected.push('\n');
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        for line in stderr_text.lines() {
            on_line(line);
        }
        debug!("nmap exited with {:?}", status.code());

        let result = NmapOutput {
            stdout: collected,
            stderr: stderr_text,
            exit_code: status.code(),
        };

        check_exit(status.success(), result)
    }
}

fn check_exit(success: bool, output: NmapOutput) -> WatchResult<NmapOutput> {
    if success {
        return Ok(output);
    }

    let message = if output.stderr.trim().is_empty() {
        "nmap exited unsuccessfully".to_string()
    } else {
        output.stderr.trim().to_string()
    };

    Err(WatchError::ProcessExecution { code: output.exit_code, message })
}

fn spawn_error(binary: &str, e: std::io::Error) -> WatchError {
    WatchError::ProcessExecution {
        code: None,
        message: format!("Failed to start {}: {}", binary, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Vec<String> {
        vec!["192.168.1.0/24".to_string()]
    }

    #[test]
    fn test_default_args() {
        let engine = NmapEngine::new(NmapSettings::default());
        assert_eq!(engine.build_args(&targets(), None, false), vec!["-sn", "192.168.1.0/24"]);
        assert_eq!(engine.build_args(&targets(), Some("   "), false), vec!["-sn", "192.168.1.0/24"]);
    }

    #[test]
    fn test_custom_args_with_progress() {
        let engine = NmapEngine::new(NmapSettings::default());
        let args = engine.build_args(&targets(), Some("-sn -PR"), true);
        assert_eq!(args, vec!["-sn", "-PR", "--stats-every", "1s", "-v", "192.168.1.0/24"]);
    }

    #[test]
    fn test_progress_flags_not_duplicated() {
        let engine = NmapEngine::new(NmapSettings::default());
        let args = engine.build_args(&targets(), Some("-sn -v --stats-every 5s"), true);
        assert_eq!(args, vec!["-sn", "-v", "--stats-every", "5s", "192.168.1.0/24"]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_process_error() {
        let engine = NmapEngine::new(NmapSettings {
            binary: "/nonexistent/lanwatch-nmap".to_string(),
            ..Default::default()
        });
        let err = engine.run(&targets(), None).await.unwrap_err();
        assert!(matches!(err, WatchError::ProcessExecution { code: None, .. }));
    }
}
