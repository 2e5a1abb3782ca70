use std::ffi::{OsStr, OsString};
use std::io;
use std::iter;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::os;

/// Command-line builder for the browser process.
///
/// Thin wrapper over [`tokio::process::Command`] keeping the program and
/// argument list inspectable until spawn.
#[derive(Debug)]
pub(crate) struct ProcessBuilder {
    program: OsString,
    stdin: Option<Stdio>,
    stdout: Option<Stdio>,
    stderr: Option<Stdio>,
    args: Vec<OsString>,
}

impl ProcessBuilder {
    pub fn new<S>(program: S) -> Self
    where
        S: AsRef<OsStr>,
    {
        let program = program.as_ref().to_os_string();
        Self {
            program,
            stdin: Some(Stdio::inherit()),
            stdout: Some(Stdio::inherit()),
            stderr: Some(Stdio::inherit()),
            args: Default::default(),
        }
    }

    pub fn stdin<T>(&mut self, cfg: T) -> &mut Self
    where
        T: Into<Stdio>,
    {
        self.stdin = Some(cfg.into());
        self
    }

    pub fn stdout<T>(&mut self, cfg: T) -> &mut Self
    where
        T: Into<Stdio>,
    {
        self.stdout = Some(cfg.into());
        self
    }

    pub fn stderr<T>(&mut self, cfg: T) -> &mut Self
    where
        T: Into<Stdio>,
    {
        self.stderr = Some(cfg.into());
        self
    }

    pub fn arg<S>(&mut self, arg: S) -> &mut Self
    where
        S: AsRef<OsStr>,
    {
        self.args(iter::once(arg))
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|s| s.as_ref().to_os_string()));
        self
    }

    pub fn spawn(mut self) -> io::Result<Process> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(self.stdin.take().unwrap())
            .stdout(self.stdout.take().unwrap())
            .stderr(self.stderr.take().unwrap())
            .kill_on_drop(true);
        command.spawn().map(Process)
    }
}

#[derive(Debug)]
pub(crate) struct Process(Child);

impl Process {
    pub async fn kill(self) {
        os::proc_kill(self.0).await;
    }

    pub fn kill_sync(self) {
        os::proc_kill_sync(self.0)
    }

    /// Returns true when the process has already exited.
    pub fn try_wait(&mut self) -> io::Result<bool> {
        os::try_wait(&mut self.0)
    }
}
