//! sshfs mounter
//!
//! Runs `sshfs` to attach a volume and `umount` to detach it. Combined
//! stdout/stderr of a failed run is returned to the caller so the container
//! runtime can show why the mount failed.

use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::MounterConfig;
use crate::error::{Result, VolumeError};
use crate::mounter::{sshfs_invocation, umount_invocation, Invocation, Mounter};
use crate::options::MountSpec;

/// Mounter backed by the sshfs and umount programs
pub struct SshfsMounter {
    config: MounterConfig,
}

impl SshfsMounter {
    pub fn new(config: MounterConfig) -> Self {
        Self { config }
    }

    /// Run `cmd` to completion, honouring the configured timeout
    async fn run(&self, cmd: &Invocation) -> Result<()> {
        debug!("Executing {}", cmd);

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VolumeError::MountExecution(format!(
                    "failed to start {}: {}",
                    cmd.program.to_string_lossy(),
                    e
                ))
            })?;

        if let (Some(input), Some(mut stdin)) = (&cmd.stdin, child.stdin.take()) {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                // sshfs may exit before reading; its output explains why
                warn!("Failed to write to {} stdin: {}", cmd.program.to_string_lossy(), e);
            }
            drop(stdin);
        }

        let output = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    VolumeError::MountExecution(format!(
                        "{} timed out after {:?}",
                        cmd.program.to_string_lossy(),
                        limit
                    ))
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| {
            VolumeError::MountExecution(format!(
                "failed to wait for {}: {}",
                cmd.program.to_string_lossy(),
                e
            ))
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(VolumeError::MountExecution(failure_message(cmd, &output)))
        }
    }
}

fn failure_message(cmd: &Invocation, output: &Output) -> String {
    let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
    captured.push_str(&String::from_utf8_lossy(&output.stderr));
    format!(
        "{} command failed {} ({})",
        cmd.program.to_string_lossy(),
        output.status,
        captured.trim()
    )
}

#[async_trait]
impl Mounter for SshfsMounter {
    async fn attach(&self, spec: &MountSpec, mount_point: &Path) -> Result<()> {
        let cmd = sshfs_invocation(&self.config.sshfs_command, spec, mount_point);
        self.run(&cmd).await
    }

    async fn detach(&self, mount_point: &Path) -> Result<()> {
        let cmd = umount_invocation(&self.config.umount_command, mount_point);
        self.run(&cmd).await
    }
}
