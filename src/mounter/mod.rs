//! Attaching and detaching remote filesystems
//!
//! The [`Mounter`] trait is the seam between the registry and the host. The
//! sshfs implementation lives in a submodule; the command lines it runs are
//! built here so they can be checked without spawning anything.

pub mod sshfs;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::options::{Credential, MountSpec};

pub use sshfs::SshfsMounter;

/// Attaches and detaches remote filesystems.
///
/// The registry decides *when* to call these (first mount, last unmount);
/// implementations only perform the attach or detach and report how it went.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Attach the remote filesystem described by `spec` at `mount_point`
    async fn attach(&self, spec: &MountSpec, mount_point: &Path) -> Result<()>;

    /// Detach whatever is mounted at `mount_point`
    async fn detach(&self, mount_point: &Path) -> Result<()>;
}

/// A fully built external command
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Data written to the child's standard input
    pub stdin: Option<String>,
}

impl Invocation {
    fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            stdin: None,
        }
    }

    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Append `-o <option>`
    fn option(&mut self, option: impl AsRef<OsStr>) -> &mut Self {
        self.arg("-o").arg(option)
    }
}

// Never print stdin, it may carry a password
impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        if self.stdin.is_some() {
            write!(f, " <stdin redacted>")?;
        }
        Ok(())
    }
}

/// Build the sshfs command line for `spec`.
///
/// Argument order is fixed: host key checking flag, target, mount point,
/// port, password flags, identity file, then pass-through options in the
/// order they were given at Create time.
pub fn sshfs_invocation(program: &str, spec: &MountSpec, mount_point: &Path) -> Invocation {
    let mut cmd = Invocation::new(program);
    cmd.arg("-oStrictHostKeyChecking=no")
        .arg(&spec.target)
        .arg(mount_point);

    if let Some(port) = &spec.port {
        cmd.arg("-p").arg(port);
    }

    match &spec.credential {
        Credential::Password { password } => {
            cmd.option("workaround=rename").option("password_stdin");
            cmd.stdin = Some(password.clone());
        }
        Credential::IdentityFile { path, .. } => {
            let mut option = OsString::from("IdentityFile=");
            option.push(path.as_os_str());
            cmd.option(option);
        }
    }

    for option in &spec.options {
        cmd.option(option);
    }

    cmd
}

/// Build the detach command for `mount_point`
pub fn umount_invocation(program: &str, mount_point: &Path) -> Invocation {
    let mut cmd = Invocation::new(program);
    cmd.arg(mount_point);
    cmd
}

/// Whether something is mounted at `path`, judged by the device id
/// differing from the parent directory's.
pub fn is_mount_point(path: &Path) -> io::Result<bool> {
    let meta = std::fs::metadata(path)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(true),
    };
    let parent_meta = std::fs::metadata(parent)?;
    Ok(meta.dev() != parent_meta.dev())
}
