//! Running commands on the remote host and locally.

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::SshConfig;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("could not start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {code:?}: {stderr}")]
    Exit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("`{command}` started without a process id")]
    NoPid { command: String },
}

/// Command execution as seen by the pipeline.
///
/// Synchronous calls return stdout and fail on a non-zero exit. Detached
/// spawns return as soon as the child has a pid.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn run_remote(&self, command: &str) -> Result<String, GatewayError>;
    async fn run_local(&self, command: &str) -> Result<String, GatewayError>;
    async fn spawn_detached_local(&self, program: &str, args: &[String])
        -> Result<u32, GatewayError>;
}

/// `ssh` for remote commands, `sh -c` for local ones.
pub struct SshGateway {
    ssh: SshConfig,
}

impl SshGateway {
    pub fn new(ssh: SshConfig) -> Self {
        Self { ssh }
    }
}

async fn output_of(mut cmd: Command, description: String) -> Result<String, GatewayError> {
    let output = cmd
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| GatewayError::Spawn {
            command: description.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(GatewayError::Exit {
            command: description,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl Gateway for SshGateway {
    async fn run_remote(&self, command: &str) -> Result<String, GatewayError> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.ssh.id_file)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(self.ssh.destination())
            .arg(command);
        output_of(cmd, format!("ssh {}: {}", self.ssh.host, command)).await
    }

    async fn run_local(&self, command: &str) -> Result<String, GatewayError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        output_of(cmd, command.to_string()).await
    }

    async fn spawn_detached_local(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<u32, GatewayError> {
        let description = format!("{} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| GatewayError::Spawn {
                command: description.clone(),
                source,
            })?;
        let Some(pid) = child.id() else {
            return Err(GatewayError::NoPid {
                command: description,
            });
        };
        // Reap the child, otherwise it lingers in the process table as a zombie
        // and the pipeline would wait on it forever.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => log::debug!("detached `{description}` ({pid}) exited with {status}"),
                Err(e) => log::warn!("could not wait on detached `{description}` ({pid}): {e}"),
            }
        });
        Ok(pid)
    }
}

/// First line of `echo $!`-style output as a pid.
pub fn parse_pid(output: &str) -> Option<u32> {
    output.lines().next()?.trim().parse().ok()
}

/// Whether `pid` appears in the output of `ps -Ao pid`.
pub fn pid_listed(ps_output: &str, pid: u32) -> bool {
    ps_output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|field| field.parse::<u32>().ok())
        .any(|listed| listed == pid)
}
