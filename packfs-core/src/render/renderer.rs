//! Pack renderer: one `nomad-pack render` invocation per job.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::parser::{parse_rendered_output, JobFiles};
use super::pty::{read_transcript, TerminalChannel, TerminalSize};
use crate::config::JobVars;
use crate::error::{PackFsError, PackFsResult};

/// Default per-render timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// How long to wait for the transcript reader after a timed-out render is killed.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// One render of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    /// Pack path or name handed to the renderer.
    pub pack: String,
    /// Template variables, passed as `--var name=value`.
    pub variables: JobVars,
    /// Pass `--parser-v1`.
    pub parser_v1: bool,
}

impl RenderRequest {
    pub fn new(pack: impl Into<String>, variables: JobVars, parser_v1: bool) -> Self {
        Self {
            pack: pack.into(),
            variables,
            parser_v1,
        }
    }

    /// Arguments after the program name.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec!["render".to_string(), self.pack.clone()];
        if self.parser_v1 {
            args.push("--parser-v1".to_string());
        }
        for (name, value) in &self.variables {
            args.push("--var".to_string());
            args.push(format!("{}={}", name, value));
        }
        args
    }
}

/// Renders one request into its files.
#[async_trait]
pub trait PackRenderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> PackFsResult<JobFiles>;
}

/// How to run the renderer.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments placed before `render` (e.g. a wrapper script path).
    pub leading_args: Vec<String>,
    /// Geometry of the child's terminal.
    pub terminal: TerminalSize,
    /// Kill the child after this long.
    pub timeout: Duration,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: "nomad-pack".to_string(),
            leading_args: Vec::new(),
            terminal: TerminalSize::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Everything one invocation produced.
struct RenderOutput {
    status: ExitStatus,
    stderr: String,
    transcript: String,
}

/// Runs `nomad-pack render` on a pseudo-terminal.
#[derive(Debug, Clone, Default)]
pub struct NomadPackRenderer {
    config: RendererConfig,
}

impl NomadPackRenderer {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    async fn run(&self, request: &RenderRequest) -> PackFsResult<RenderOutput> {
        let spawn_err = |source| PackFsError::Spawn {
            pack: request.pack.clone(),
            source,
        };

        let channel = TerminalChannel::open(self.config.terminal).map_err(spawn_err)?;
        let (master, slave) = channel.into_parts();

        let args = request.command_args();
        debug!(program = %self.config.program, ?args, "spawning renderer");

        // The command owns our copy of the slave; dropping it at the end of
        // this block leaves the child as the only writer. The child leads its
        // own process group so a timeout can take down anything it started.
        let mut child = {
            let mut command = Command::new(&self.config.program);
            command
                .args(&self.config.leading_args)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::from(slave))
                .stderr(Stdio::piped())
                .process_group(0)
                .kill_on_drop(true);
            command.spawn().map_err(spawn_err)?
        };
        let pgid = child.id();

        let mut reader = tokio::task::spawn_blocking(move || read_transcript(master));
        let mut stderr_pipe = child.stderr.take();

        let finished = tokio::time::timeout(self.config.timeout, async {
            let mut stderr = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_end(&mut stderr).await?;
            }
            let status = child.wait().await?;
            let transcript = (&mut reader).await.map_err(std::io::Error::other)?;
            Ok::<_, std::io::Error>(RenderOutput {
                status,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                transcript,
            })
        })
        .await;

        match finished {
            Ok(output) => Ok(output?),
            Err(_) => {
                warn!(pack = %request.pack, "renderer timed out, killing its process group");
                if let Some(pgid) = pgid {
                    kill_process_group(pgid);
                }
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "renderer already gone");
                }
                let _ = child.wait().await;

                // With every slave holder gone the reader sees end-of-stream.
                if tokio::time::timeout(KILL_GRACE, &mut reader).await.is_err() {
                    warn!(pack = %request.pack, "terminal still held open after kill");
                }
                Err(PackFsError::RenderTimeout {
                    seconds: self.config.timeout.as_secs(),
                })
            }
        }
    }
}

fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[async_trait]
impl PackRenderer for NomadPackRenderer {
    async fn render(&self, request: &RenderRequest) -> PackFsResult<JobFiles> {
        let output = self.run(request).await?;

        if !output.status.success() {
            return Err(PackFsError::Render {
                pack: request.pack.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: output.stderr.trim().to_string(),
            });
        }

        debug!(
            pack = %request.pack,
            bytes = output.transcript.len(),
            "renderer finished"
        );
        parse_rendered_output(&output.transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> JobVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_command_args() {
        let request = RenderRequest::new("hello", vars(&[("job_name", "job1"), ("x", "1")]), false);
        assert_eq!(
            request.command_args(),
            vec!["render", "hello", "--var", "job_name=job1", "--var", "x=1"]
        );
    }

    #[test]
    fn test_command_args_parser_v1() {
        let request = RenderRequest::new("./packs/web", JobVars::new(), true);
        assert_eq!(
            request.command_args(),
            vec!["render", "./packs/web", "--parser-v1"]
        );
    }

    #[test]
    fn test_value_with_equals_kept_whole() {
        let request = RenderRequest::new("p", vars(&[("args", "a=b c")]), false);
        assert_eq!(request.command_args()[3], "args=a=b c");
    }

    #[test]
    fn test_default_config() {
        let config = RendererConfig::default();
        assert_eq!(config.program, "nomad-pack");
        assert!(config.leading_args.is_empty());
        assert_eq!(config.terminal, TerminalSize { rows: 24, cols: 80 });
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let renderer = NomadPackRenderer::new(RendererConfig {
            program: "/nonexistent/nomad-pack".to_string(),
            ..RendererConfig::default()
        });
        let request = RenderRequest::new("hello", JobVars::new(), false);
        let err = renderer.render(&request).await.unwrap_err();
        assert!(matches!(err, PackFsError::Spawn { .. }));
    }
}
