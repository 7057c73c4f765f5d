//! Sandbox, credential and deploy adapters
//!
//! [`MemorySandbox`] keeps files in a map and answers a handful of built-in
//! commands (`true`, `false`, `test -f`, `cat`, `ls`) plus any scripted ones.
//! [`LocalDirSandbox`] writes to a directory and runs commands through
//! `sh -c`.

use crate::error::{ForgeError, ForgeResult};
use crate::ports::{
    CredentialStore, DeployReceipt, DeployTarget, ExecOutput, SandboxFactory, WorkspaceSandbox,
};
use crate::types::SessionId;
use async_trait::async_trait;
use dashmap::DashMap;
use forge_artifact::{Snapshot, WorkspacePath};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Scripted command: gets the command line and current files, returns
/// `None` to fall through to the built-ins
pub type CommandHandler =
    Arc<dyn Fn(&str, &BTreeMap<WorkspacePath, Vec<u8>>) -> Option<ExecOutput> + Send + Sync>;

/// In-memory sandbox
#[derive(Default)]
pub struct MemorySandbox {
    label: String,
    files: RwLock<BTreeMap<WorkspacePath, Vec<u8>>>,
    handlers: Vec<CommandHandler>,
    commands: Mutex<Vec<String>>,
}

impl fmt::Debug for MemorySandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySandbox")
            .field("label", &self.label)
            .field("files", &self.files.read().len())
            .finish_non_exhaustive()
    }
}

impl MemorySandbox {
    /// Empty sandbox
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// With a scripted command handler
    #[must_use]
    pub fn with_handler(mut self, handler: CommandHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Sandbox label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Copy of every file
    #[must_use]
    pub fn files(&self) -> BTreeMap<WorkspacePath, Vec<u8>> {
        self.files.read().clone()
    }

    /// File as text
    #[must_use]
    pub fn read_text(&self, path: &WorkspacePath) -> Option<String> {
        self.files
            .read()
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Commands run so far
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    fn builtin(&self, command: &str, files: &BTreeMap<WorkspacePath, Vec<u8>>) -> ExecOutput {
        let mut parts = command.split_whitespace();
        let program = parts.next().unwrap_or_default();
        let arg = parts.next();
        let lookup = |raw: Option<&str>| raw.and_then(|p| WorkspacePath::new(p).ok()).and_then(|p| files.get(&p));
        match program {
            "true" => ok(""),
            "false" => fail(1, ""),
            "test" if arg == Some("-f") => {
                if lookup(parts.next()).is_some() {
                    ok("")
                } else {
                    fail(1, "")
                }
            }
            "cat" => match lookup(arg) {
                Some(bytes) => ok(&String::from_utf8_lossy(bytes)),
                None => fail(1, &format!("cat: {}: No such file or directory", arg.unwrap_or(""))),
            },
            "ls" => ok(&files
                .keys()
                .map(WorkspacePath::as_str)
                .collect::<Vec<_>>()
                .join("\n")),
            _ => fail(127, &format!("{program}: command not found")),
        }
    }
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

#[async_trait]
impl WorkspaceSandbox for MemorySandbox {
    async fn write_file(&self, path: &WorkspacePath, content: &[u8]) -> ForgeResult<()> {
        self.files.write().insert(path.clone(), content.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &WorkspacePath) -> ForgeResult<Option<Vec<u8>>> {
        Ok(self.files.read().get(path).cloned())
    }

    async fn delete_file(&self, path: &WorkspacePath) -> ForgeResult<()> {
        self.files.write().remove(path);
        Ok(())
    }

    async fn exec(&self, command: &str) -> ForgeResult<ExecOutput> {
        self.commands.lock().push(command.to_string());
        let files = self.files.read().clone();
        for handler in &self.handlers {
            if let Some(output) = handler(command, &files) {
                return Ok(output);
            }
        }
        Ok(self.builtin(command, &files))
    }
}

/// Hands out [`MemorySandbox`]es and keeps them reachable by label
#[derive(Default)]
pub struct MemorySandboxFactory {
    handlers: Vec<CommandHandler>,
    created: DashMap<String, Arc<MemorySandbox>>,
}

impl fmt::Debug for MemorySandboxFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySandboxFactory")
            .field("created", &self.created.len())
            .finish_non_exhaustive()
    }
}

impl MemorySandboxFactory {
    /// Factory with only built-in commands
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sandbox created from now on gets `handler`
    #[must_use]
    pub fn with_handler(mut self, handler: CommandHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Latest sandbox created under `label`
    #[must_use]
    pub fn get(&self, label: &str) -> Option<Arc<MemorySandbox>> {
        self.created.get(label).map(|s| Arc::clone(s.value()))
    }

    /// Labels created so far
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.created.iter().map(|e| e.key().clone()).collect();
        labels.sort();
        labels
    }
}

impl SandboxFactory for MemorySandboxFactory {
    fn create(&self, label: &str) -> ForgeResult<Arc<dyn WorkspaceSandbox>> {
        let mut sandbox = MemorySandbox::new(label);
        sandbox.handlers.clone_from(&self.handlers);
        let sandbox = Arc::new(sandbox);
        self.created.insert(label.to_string(), Arc::clone(&sandbox));
        Ok(sandbox)
    }
}

/// Sandbox rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalDirSandbox {
    root: PathBuf,
}

impl LocalDirSandbox {
    /// Sandbox at `root`, created if missing
    ///
    /// # Errors
    /// [`ForgeError::Sandbox`] if the directory cannot be created
    pub fn new(root: impl Into<PathBuf>) -> ForgeResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ForgeError::Sandbox(format!("{}: {e}", root.display())))?;
        Ok(Self { root })
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &WorkspacePath) -> PathBuf {
        self.root.join(path.as_str())
    }
}

fn io_err(path: &Path, err: std::io::Error) -> ForgeError {
    ForgeError::Sandbox(format!("{}: {err}", path.display()))
}

#[async_trait]
impl WorkspaceSandbox for LocalDirSandbox {
    async fn write_file(&self, path: &WorkspacePath, content: &[u8]) -> ForgeResult<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| io_err(parent, e))?;
        }
        tokio::fs::write(&target, content).await.map_err(|e| io_err(&target, e))
    }

    async fn read_file(&self, path: &WorkspacePath) -> ForgeResult<Option<Vec<u8>>> {
        let target = self.resolve(path);
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&target, e)),
        }
    }

    async fn delete_file(&self, path: &WorkspacePath) -> ForgeResult<()> {
        let target = self.resolve(path);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&target, e)),
        }
    }

    async fn exec(&self, command: &str) -> ForgeResult<ExecOutput> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ForgeError::Sandbox(format!("{command}: {e}")))?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // Killed by a signal: report as a failure, never as success
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Creates one subdirectory per sandbox under a base directory
#[derive(Debug, Clone)]
pub struct LocalDirSandboxFactory {
    base: PathBuf,
}

impl LocalDirSandboxFactory {
    /// Factory rooted at `base`
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl SandboxFactory for LocalDirSandboxFactory {
    fn create(&self, label: &str) -> ForgeResult<Arc<dyn WorkspaceSandbox>> {
        let dir: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Ok(Arc::new(LocalDirSandbox::new(self.base.join(dir))?))
    }
}

/// Secrets from a fixed map
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    secrets: HashMap<String, String>,
}

impl MemoryCredentialStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With one secret
    #[must_use]
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_secret(&self, name: &str) -> ForgeResult<Option<String>> {
        Ok(self.secrets.get(name).cloned())
    }
}

/// Deploy target that records what it was asked to ship
#[derive(Debug, Default)]
pub struct RecordingDeployTarget {
    deployed: Mutex<Vec<DeployReceipt>>,
}

impl RecordingDeployTarget {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receipts so far
    #[must_use]
    pub fn deployed(&self) -> Vec<DeployReceipt> {
        self.deployed.lock().clone()
    }
}

#[async_trait]
impl DeployTarget for RecordingDeployTarget {
    async fn deploy(&self, session_id: SessionId, snapshot: &Snapshot) -> ForgeResult<DeployReceipt> {
        let receipt = DeployReceipt {
            url: format!("memory://{session_id}/{}", snapshot.revision()),
            revision: snapshot.revision(),
        };
        self.deployed.lock().push(receipt.clone());
        Ok(receipt)
    }
}
