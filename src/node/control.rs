//! Control Tool
//!
//! Thin async wrapper over `initdb` and `pg_ctl`. ProcessHost owns the
//! precondition checks; this layer only runs commands and captures results.

use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    /// stdout followed by stderr, decoded lossily
    pub text: String,
}

impl CommandOutput {
    pub fn status_label(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Self {
            success: output.status.success(),
            code: output.status.code(),
            text: text.trim().to_string(),
        }
    }
}

/// Process-level operations against one storage area
#[async_trait]
pub trait ControlTool: Send + Sync {
    /// Initialize a storage area (`initdb`)
    async fn init(&self, data_dir: &Path, superuser: &str) -> io::Result<CommandOutput>;

    /// Query the server (`pg_ctl status`)
    async fn status(&self, data_dir: &Path) -> io::Result<CommandOutput>;

    /// Spawn the server without waiting for it (`pg_ctl start`)
    fn launch(&self, data_dir: &Path, port: u16) -> io::Result<()>;

    /// Stop the server and wait for the command to exit (`pg_ctl stop`)
    async fn stop(&self, data_dir: &Path) -> io::Result<CommandOutput>;
}

/// `initdb` / `pg_ctl` from the host environment
#[derive(Debug, Clone)]
pub struct PgCtl {
    initdb: String,
    pg_ctl: String,
}

impl PgCtl {
    pub fn new(initdb: impl Into<String>, pg_ctl: impl Into<String>) -> Self {
        Self {
            initdb: initdb.into(),
            pg_ctl: pg_ctl.into(),
        }
    }
}

impl Default for PgCtl {
    fn default() -> Self {
        Self::new("initdb", "pg_ctl")
    }
}

#[async_trait]
impl ControlTool for PgCtl {
    async fn init(&self, data_dir: &Path, superuser: &str) -> io::Result<CommandOutput> {
        debug!(data_dir = %data_dir.display(), "initdb");
        let output = Command::new(&self.initdb)
            .arg("-D")
            .arg(data_dir)
            .arg(format!("--username={}", superuser))
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output.into())
    }

    async fn status(&self, data_dir: &Path) -> io::Result<CommandOutput> {
        let output = Command::new(&self.pg_ctl)
            .arg("-D")
            .arg(data_dir)
            .arg("status")
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output.into())
    }

    fn launch(&self, data_dir: &Path, port: u16) -> io::Result<()> {
        debug!(data_dir = %data_dir.display(), port, "pg_ctl start");
        // Not awaited: the child outlives this call and tokio reaps it.
        Command::new(&self.pg_ctl)
            .arg("-D")
            .arg(data_dir)
            .arg("-o")
            .arg(format!("-p{}", port))
            .arg("start")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }

    async fn stop(&self, data_dir: &Path) -> io::Result<CommandOutput> {
        debug!(data_dir = %data_dir.display(), "pg_ctl stop");
        let output = Command::new(&self.pg_ctl)
            .arg("-D")
            .arg(data_dir)
            .arg("stop")
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output.into())
    }
}

/// Scripted control tool for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct MockControl {
        running: Mutex<HashSet<PathBuf>>,
        launch_count: AtomicUsize,
        stop_count: AtomicUsize,
        /// Replaces the computed status output when set
        status_override: Mutex<Option<CommandOutput>>,
        fail_init: Mutex<bool>,
        fail_launch: Mutex<bool>,
        fail_stop_exit: Mutex<bool>,
    }

    impl MockControl {
        pub fn new() -> Self {
            Self {
                running: Mutex::new(HashSet::new()),
                launch_count: AtomicUsize::new(0),
                stop_count: AtomicUsize::new(0),
                status_override: Mutex::new(None),
                fail_init: Mutex::new(false),
                fail_launch: Mutex::new(false),
                fail_stop_exit: Mutex::new(false),
            }
        }

        pub fn set_status_override(&self, output: Option<CommandOutput>) {
            *self.status_override.lock().unwrap() = output;
        }

        pub fn set_fail_init(&self, fail: bool) {
            *self.fail_init.lock().unwrap() = fail;
        }

        pub fn set_fail_launch(&self, fail: bool) {
            *self.fail_launch.lock().unwrap() = fail;
        }

        pub fn set_fail_stop_exit(&self, fail: bool) {
            *self.fail_stop_exit.lock().unwrap() = fail;
        }

        pub fn launch_count(&self) -> usize {
            self.launch_count.load(Ordering::SeqCst)
        }

        pub fn stop_count(&self) -> usize {
            self.stop_count.load(Ordering::SeqCst)
        }

        pub fn is_running(&self, data_dir: &Path) -> bool {
            self.running.lock().unwrap().contains(data_dir)
        }
    }

    fn output(success: bool, code: i32, text: &str) -> CommandOutput {
        CommandOutput {
            success,
            code: Some(code),
            text: text.to_string(),
        }
    }

    #[async_trait]
    impl ControlTool for MockControl {
        async fn init(&self, data_dir: &Path, _superuser: &str) -> io::Result<CommandOutput> {
            if *self.fail_init.lock().unwrap() {
                return Ok(output(false, 1, "initdb: error: mock failure"));
            }
            std::fs::create_dir_all(data_dir)?;
            Ok(output(true, 0, "Success."))
        }

        async fn status(&self, data_dir: &Path) -> io::Result<CommandOutput> {
            if let Some(scripted) = self.status_override.lock().unwrap().clone() {
                return Ok(scripted);
            }
            if self.is_running(data_dir) {
                Ok(output(true, 0, "pg_ctl: server is running (PID: 4242)"))
            } else {
                Ok(output(false, 3, "pg_ctl: no server running"))
            }
        }

        fn launch(&self, data_dir: &Path, _port: u16) -> io::Result<()> {
            if *self.fail_launch.lock().unwrap() {
                return Err(io::Error::new(io::ErrorKind::NotFound, "pg_ctl not found"));
            }
            self.launch_count.fetch_add(1, Ordering::SeqCst);
            self.running.lock().unwrap().insert(data_dir.to_path_buf());
            Ok(())
        }

        async fn stop(&self, data_dir: &Path) -> io::Result<CommandOutput> {
            self.stop_count.fetch_add(1, Ordering::SeqCst);
            self.running.lock().unwrap().remove(data_dir);
            if *self.fail_stop_exit.lock().unwrap() {
                Ok(output(false, 1, "pg_ctl: server does not shut down"))
            } else {
                Ok(output(true, 0, "server stopped"))
            }
        }
    }
}

#[cfg(test)]
pub use mock::MockControl;
