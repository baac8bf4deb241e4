// src/hooks.rs

//! Pre/post-install hook delegation
//!
//! Hook execution itself (mounting the image into a scratch namespace and
//! sandboxing the hook binary) belongs to an external collaborator; this
//! module owns the seam and the gating rule: hooks run only when at least
//! one package in the set declares the matching hook, and an empty package
//! set is an error.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::error::{Error, Result};
use crate::package::ApexFile;

/// Default hook execution timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Which hook a run is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PreInstall,
    PostInstall,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInstall => "pre-install",
            Self::PostInstall => "post-install",
        }
    }
}

/// Execution of hooks over a set of verified packages
pub trait HookRunner: Send + Sync {
    fn run(&self, phase: HookPhase, packages: &[ApexFile]) -> Result<()>;
}

/// Run pre-install hooks for `packages` if any package declares one.
pub fn run_pre_install(runner: &dyn HookRunner, packages: &[ApexFile]) -> Result<()> {
    run_phase(runner, HookPhase::PreInstall, packages, |apex| {
        apex.manifest().pre_install_hook.is_some()
    })
}

/// Run post-install hooks for `packages` if any package declares one.
pub fn run_post_install(runner: &dyn HookRunner, packages: &[ApexFile]) -> Result<()> {
    run_phase(runner, HookPhase::PostInstall, packages, |apex| {
        apex.manifest().post_install_hook.is_some()
    })
}

fn run_phase(
    runner: &dyn HookRunner,
    phase: HookPhase,
    packages: &[ApexFile],
    has_hook: impl Fn(&ApexFile) -> bool,
) -> Result<()> {
    if packages.is_empty() {
        return Err(Error::BadInput("empty set of inputs".to_string()));
    }
    if !packages.iter().any(has_hook) {
        debug!("no {} hooks declared, skipping", phase.as_str());
        return Ok(());
    }
    runner.run(phase, packages)
}

/// No-op runner for configurations and tests without a hook sandbox.
#[derive(Debug, Default)]
pub struct NullHookRunner;

impl HookRunner for NullHookRunner {
    fn run(&self, phase: HookPhase, packages: &[ApexFile]) -> Result<()> {
        for apex in packages {
            debug!(
                "hook sandbox disabled; skipping {} hook for {}",
                phase.as_str(),
                apex.package_id()
            );
        }
        Ok(())
    }
}

/// Delegates each declared hook to the sandbox helper binary with a
/// bounded timeout and a nulled stdin so a misbehaving hook cannot hang
/// the activation worker.
pub struct ScriptHookRunner {
    helper: PathBuf,
    timeout: Duration,
}

impl ScriptHookRunner {
    pub fn new<P: Into<PathBuf>>(helper: P) -> Self {
        Self {
            helper: helper.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl HookRunner for ScriptHookRunner {
    fn run(&self, phase: HookPhase, packages: &[ApexFile]) -> Result<()> {
        for apex in packages {
            let hook = match phase {
                HookPhase::PreInstall => &apex.manifest().pre_install_hook,
                HookPhase::PostInstall => &apex.manifest().post_install_hook,
            };
            let Some(hook) = hook else { continue };

            info!(
                "running {} hook '{}' for {}",
                phase.as_str(),
                hook,
                apex.package_id()
            );
            let mut child = Command::new(&self.helper)
                .arg(phase.as_str())
                .arg(apex.path())
                .arg(hook)
                .stdin(Stdio::null())
                .spawn()
                .map_err(|e| {
                    Error::Hook(format!(
                        "failed to spawn {} for {}: {}",
                        self.helper.display(),
                        apex.package_id(),
                        e
                    ))
                })?;

            let status = match child
                .wait_timeout(self.timeout)
                .map_err(|e| Error::Hook(format!("failed to wait for hook: {}", e)))?
            {
                Some(status) => status,
                None => {
                    warn!(
                        "{} hook for {} timed out after {:?}, killing",
                        phase.as_str(),
                        apex.package_id(),
                        self.timeout
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Hook(format!(
                        "{} hook for {} timed out",
                        phase.as_str(),
                        apex.package_id()
                    )));
                }
            };

            if !status.success() {
                return Err(Error::Hook(format!(
                    "{} hook for {} exited with {}",
                    phase.as_str(),
                    apex.package_id(),
                    status
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    /// Records invocations instead of executing anything.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<(HookPhase, Vec<String>)>>,
    }

    impl HookRunner for RecordingRunner {
        fn run(&self, phase: HookPhase, packages: &[ApexFile]) -> Result<()> {
            self.calls.lock().unwrap().push((
                phase,
                packages.iter().map(|p| p.package_id()).collect(),
            ));
            Ok(())
        }
    }

    fn write_package(dir: &Path, name: &str, pre_hook: Option<&str>) -> ApexFile {
        let path = dir.join(format!("{}.apex", name));
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ZipWriter::new(file);
        let stored = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        let manifest = match pre_hook {
            Some(hook) => format!(
                r#"{{"name":"{}","version":1,"pre_install_hook":"{}"}}"#,
                name, hook
            ),
            None => format!(r#"{{"name":"{}","version":1}}"#, name),
        };
        writer.start_file("manifest.json", stored).unwrap();
        writer.write_all(manifest.as_bytes()).unwrap();
        writer.start_file("image.img", stored).unwrap();
        writer.write_all(&[0u8; 4096]).unwrap();
        writer.finish().unwrap();
        ApexFile::open(&path).unwrap()
    }

    #[test]
    fn test_hooks_gated_on_declaration() {
        let dir = TempDir::new().unwrap();
        let runner = RecordingRunner::default();
        let plain = write_package(dir.path(), "com.example.plain", None);

        run_pre_install(&runner, &[plain]).unwrap();
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_hooks_invoked_when_declared() {
        let dir = TempDir::new().unwrap();
        let runner = RecordingRunner::default();
        let hooked = write_package(dir.path(), "com.example.hooked", Some("bin/pre.sh"));
        let plain = write_package(dir.path(), "com.example.plain", None);

        run_pre_install(&runner, &[hooked, plain]).unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, HookPhase::PreInstall);
        // The whole verified set is handed over, not just the hooked one.
        assert_eq!(calls[0].1.len(), 2);
    }

    #[test]
    fn test_empty_set_rejected() {
        let runner = RecordingRunner::default();
        let err = run_pre_install(&runner, &[]).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn test_script_runner_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let hooked = write_package(dir.path(), "com.example.hooked", Some("bin/pre.sh"));
        let runner = ScriptHookRunner::new("/bin/false");

        let err = run_pre_install(&runner, &[hooked]).unwrap_err();
        assert!(matches!(err, Error::Hook(_)));
    }

    #[test]
    fn test_script_runner_success() {
        let dir = TempDir::new().unwrap();
        let hooked = write_package(dir.path(), "com.example.hooked", Some("bin/pre.sh"));
        let runner = ScriptHookRunner::new("/bin/true");

        run_pre_install(&runner, &[hooked]).unwrap();
    }
}
