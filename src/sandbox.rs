//! The hermetic build sandbox: an ephemeral directory with a restricted
//! `bin/` and a `src/` where the build command actually runs.

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use tempfile::TempDir;

use crate::error::CommandFailure;
use crate::fileset::FileSet;
use crate::ignore_matcher::IgnoreMatcher;

/// A throwaway directory containing `bin/` (symlinked executables on
/// `PATH`) and `src/` (the command's working directory).
pub struct Sandbox {
    dir: TempDir,
    src_dir: PathBuf,
}

impl Sandbox {
    fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("nozem-sandbox-")
            .tempdir()
            .context("creating sandbox directory")?;
        fs::create_dir_all(dir.path().join("bin")).context("creating sandbox bin/")?;
        fs::create_dir_all(dir.path().join("src")).context("creating sandbox src/")?;
        let src_dir = dir.path().join("src");
        Ok(Sandbox { dir, src_dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.dir.path().join("bin")
    }

    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    /// Moves `srcDir` to a subdirectory, mirroring the monorepo's own
    /// layout (e.g. `packages/foo`) so tools that look at path structure
    /// see something familiar.
    pub fn move_src_dir(&mut self, relative: impl AsRef<Path>) -> Result<()> {
        let new_src = self.dir.path().join("src").join(relative.as_ref());
        self.resolve_and_validate(&new_src)?;
        fs::create_dir_all(&new_src).context("creating relocated src dir")?;
        self.src_dir = new_src;
        Ok(())
    }

    /// Installs a symlink in `bin/` pointing at `abs_target`, under
    /// `name` (defaulting to the target's file name). An existing link at
    /// that name is replaced.
    pub fn install_executable(&self, abs_target: &Path, name: Option<&str>) -> Result<()> {
        let name = match name {
            Some(n) => n.to_string(),
            None => abs_target
                .file_name()
                .and_then(OsStr::to_str)
                .ok_or_else(|| anyhow!("executable target has no file name: {}", abs_target.display()))?
                .to_string(),
        };
        let link_path = self.bin_dir().join(&name);
        self.resolve_and_validate(&link_path)?;
        if link_path.exists() || link_path.symlink_metadata().is_ok() {
            fs::remove_file(&link_path).ok();
        }
        symlink(abs_target, &link_path)
            .with_context(|| format!("linking {} -> {}", link_path.display(), abs_target.display()))?;
        Ok(())
    }

    /// Symlinks `abs_target` at `rel_source`, anywhere under the sandbox
    /// root (used for bundled dependency installation).
    pub fn install_symlink(&self, rel_source: &Path, abs_target: &Path) -> Result<()> {
        let link_path = self.dir.path().join(rel_source);
        self.resolve_and_validate(&link_path)?;
        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent)?;
        }
        symlink(abs_target, &link_path)
            .with_context(|| format!("linking {} -> {}", link_path.display(), abs_target.display()))?;
        Ok(())
    }

    /// Copies every file in `file_set` into `src/<subdir>`, preserving
    /// symlinks as links rather than dereferencing them.
    pub fn add_src_files(&self, file_set: &FileSet, subdir: Option<&Path>) -> Result<()> {
        let target_root = match subdir {
            Some(sub) => self.src_dir.join(sub),
            None => self.src_dir.clone(),
        };
        self.resolve_and_validate(&target_root)?;
        for rel in file_set.paths() {
            let source = file_set.root().join(rel);
            let dest = target_root.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let meta = fs::symlink_metadata(&source)
                .with_context(|| format!("reading metadata for {}", source.display()))?;
            if meta.file_type().is_symlink() {
                let target = fs::read_link(&source)?;
                symlink(&target, &dest)
                    .with_context(|| format!("preserving symlink {}", dest.display()))?;
            } else {
                fs::copy(&source, &dest)
                    .with_context(|| format!("copying {} -> {}", source.display(), dest.display()))?;
            }
        }
        Ok(())
    }

    /// Ensures a zero-byte file exists at `rel_path` under `src/`.
    pub fn touch_file(&self, rel_path: impl AsRef<Path>) -> Result<()> {
        let path = self.src_dir.join(rel_path.as_ref());
        self.resolve_and_validate(&path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            fs::write(&path, []).with_context(|| format!("touching {}", path.display()))?;
        }
        Ok(())
    }

    /// Runs `command` under `/bin/sh -c`, with `PATH` restricted to
    /// `bin/`, `cwd` set to `src_dir`, and `env_override` merged in. On
    /// non-zero exit, the full detail is logged to stderr and a concise
    /// single-line error is returned.
    pub fn execute(&self, command: &str, env_override: &[(String, String)]) -> Result<()> {
        let bin_dir = self.bin_dir();
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.src_dir)
            .env_clear()
            .env("PATH", &bin_dir);
        for (key, value) in env_override {
            cmd.env(key, value);
        }
        let output = cmd
            .output()
            .with_context(|| format!("spawning sandboxed command: {command}"))?;
        if !output.status.success() {
            let failure = CommandFailure {
                command: command.to_string(),
                cwd: self.src_dir.display().to_string(),
                env: env_override.to_vec(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            let summary = failure.log_and_summarize();
            bail!(summary);
        }
        Ok(())
    }

    /// Returns a `FileSet` of everything still in `src/` matching
    /// `matcher`.
    pub fn in_source_artifacts(&self, matcher: &IgnoreMatcher) -> Result<FileSet> {
        FileSet::walk(&self.src_dir, matcher)
    }

    /// Every path touched inside the sandbox must stay within its root;
    /// this is the boundary check every write operation goes through.
    fn resolve_and_validate(&self, candidate: &Path) -> Result<()> {
        let root = self.dir.path();
        if !candidate.starts_with(root) {
            bail!(
                "sandbox operation attempted to escape sandbox root: {}",
                candidate.display()
            );
        }
        Ok(())
    }

    /// Leaks the temp directory so it survives past this value's drop,
    /// returning its path. Used when `with` needs to preserve a failed
    /// sandbox for post-mortem inspection.
    fn into_path(self) -> PathBuf {
        self.dir.keep()
    }
}

/// Scoped acquisition: creates a sandbox, invokes `f`, and deletes the
/// directory on normal return. On error, the sandbox directory is left in
/// place and its path logged, so a user can inspect it.
pub fn with<T>(f: impl FnOnce(&mut Sandbox) -> Result<T>) -> Result<T> {
    let mut sandbox = Sandbox::create()?;
    match f(&mut sandbox) {
        Ok(value) => Ok(value),
        Err(err) => {
            let path = sandbox.into_path();
            eprintln!("sandbox preserved for inspection at {}", path.display());
            Err(err)
        }
    }
}
