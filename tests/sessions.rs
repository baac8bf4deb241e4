// tests/sessions.rs

//! Staged-session workflow: submit, mark ready, boot-time activation scan.

mod common;

use std::sync::{Arc, Mutex};

use apexd::hooks::{HookPhase, HookRunner};
use apexd::package::{find_package_files, ApexFile};
use apexd::session::{session_dir, SessionState, StagedSession};
use apexd::{Apexd, AvbSignatureReader, Error, Result};
use common::{test_config, trust_key, PackageBuilder};
use tempfile::TempDir;

/// Records hook invocations; shared handle survives handing the runner to
/// the controller.
#[derive(Clone, Default)]
struct RecordingHooks {
    calls: Arc<Mutex<Vec<(HookPhase, Vec<String>)>>>,
}

impl HookRunner for RecordingHooks {
    fn run(&self, phase: HookPhase, packages: &[ApexFile]) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((phase, packages.iter().map(|p| p.package_id()).collect()));
        Ok(())
    }
}

fn apexd_with_hooks(config: &apexd::ApexdConfig, hooks: RecordingHooks) -> Apexd {
    Apexd::new(
        config.clone(),
        Box::new(AvbSignatureReader),
        Box::new(hooks),
    )
}

#[test]
fn test_submit_session_verifies_and_persists() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    trust_key(&config, "com.example.apex");
    PackageBuilder::new("com.example.apex", 1)
        .write_to(&session_dir(&config.sessions_dir, 239).join("base.apex"));

    let hooks = RecordingHooks::default();
    let apexd = apexd_with_hooks(&config, hooks.clone());

    let verified = apexd.submit_staged_session(239, &[]).unwrap();
    assert_eq!(verified.len(), 1);
    assert_eq!(verified[0].package_id(), "com.example.apex@1");

    let session = StagedSession::get(&config.sessions_dir, 239).unwrap();
    assert_eq!(session.state(), SessionState::Verified);
    // No hook declared, so no invocation.
    assert!(hooks.calls.lock().unwrap().is_empty());
}

#[test]
fn test_submit_session_runs_pre_install_hooks() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    trust_key(&config, "com.example.preinstall");
    PackageBuilder::new("com.example.preinstall", 1)
        .pre_install_hook("bin/pre.sh")
        .write_to(&session_dir(&config.sessions_dir, 41).join("base.apex"));

    let hooks = RecordingHooks::default();
    let apexd = apexd_with_hooks(&config, hooks.clone());
    apexd.submit_staged_session(41, &[]).unwrap();

    let calls = hooks.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, HookPhase::PreInstall);
    assert_eq!(calls[0].1, vec!["com.example.preinstall@1".to_string()]);
}

#[test]
fn test_submit_session_with_children() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    trust_key(&config, "com.example.a");
    trust_key(&config, "com.example.b");
    PackageBuilder::new("com.example.a", 1)
        .write_to(&session_dir(&config.sessions_dir, 11).join("a.apex"));
    PackageBuilder::new("com.example.b", 1)
        .write_to(&session_dir(&config.sessions_dir, 12).join("b.apex"));

    let apexd = apexd_with_hooks(&config, RecordingHooks::default());
    let verified = apexd.submit_staged_session(10, &[11, 12]).unwrap();
    assert_eq!(verified.len(), 2);

    let session = StagedSession::get(&config.sessions_dir, 10).unwrap();
    assert_eq!(session.child_ids(), &[11, 12]);
}

#[test]
fn test_submit_rejects_untrusted_package() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    PackageBuilder::new("com.example.apex", 1)
        .write_to(&session_dir(&config.sessions_dir, 7).join("base.apex"));

    let apexd = apexd_with_hooks(&config, RecordingHooks::default());
    let err = apexd.submit_staged_session(7, &[]).unwrap_err();
    assert!(matches!(err, Error::VerityNoKey(_)));
    // Rejected sessions are not persisted as verified.
    assert!(StagedSession::get(&config.sessions_dir, 7).is_err());
}

#[test]
fn test_submit_rejects_crowded_session_dir() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    trust_key(&config, "com.example.apex");
    let dir = session_dir(&config.sessions_dir, 8);
    PackageBuilder::new("com.example.apex", 1).write_to(&dir.join("one.apex"));
    PackageBuilder::new("com.example.apex", 2).write_to(&dir.join("two.apex"));

    let apexd = apexd_with_hooks(&config, RecordingHooks::default());
    let err = apexd.submit_staged_session(8, &[]).unwrap_err();
    assert!(matches!(err, Error::Session(_)));
}

#[test]
fn test_mark_ready_transitions() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    trust_key(&config, "com.example.apex");
    PackageBuilder::new("com.example.apex", 1)
        .write_to(&session_dir(&config.sessions_dir, 5).join("base.apex"));

    let apexd = apexd_with_hooks(&config, RecordingHooks::default());
    apexd.submit_staged_session(5, &[]).unwrap();

    apexd.mark_staged_session_ready(5).unwrap();
    assert_eq!(
        StagedSession::get(&config.sessions_dir, 5).unwrap().state(),
        SessionState::Staged
    );

    // Marking an already staged session is a no-op.
    apexd.mark_staged_session_ready(5).unwrap();

    // Unknown sessions are an error.
    assert!(matches!(
        apexd.mark_staged_session_ready(999).unwrap_err(),
        Error::Session(_)
    ));
}

#[test]
fn test_scan_activates_staged_session() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    trust_key(&config, "com.example.preinstall");
    PackageBuilder::new("com.example.preinstall", 1)
        .post_install_hook("bin/post.sh")
        .write_to(&session_dir(&config.sessions_dir, 77).join("base.apex"));

    let hooks = RecordingHooks::default();
    let mut apexd = apexd_with_hooks(&config, hooks.clone());
    apexd.submit_staged_session(77, &[]).unwrap();
    apexd.mark_staged_session_ready(77).unwrap();

    apexd.scan_staged_sessions();

    // Staged into the active directory, but deliberately not mounted:
    // activation is a separate step.
    let staged = find_package_files(&config.active_dir, false).unwrap();
    assert_eq!(staged.len(), 1);
    assert!(staged[0].ends_with("com.example.preinstall@1.apex"));
    assert!(!config.apex_root.join("com.example.preinstall@1").exists());
    assert!(!config.apex_root.join("com.example.preinstall").exists());

    assert_eq!(
        StagedSession::get(&config.sessions_dir, 77).unwrap().state(),
        SessionState::Activated
    );

    // Post-install ran during the scan.
    let calls = hooks.calls.lock().unwrap();
    assert!(calls
        .iter()
        .any(|(phase, _)| *phase == HookPhase::PostInstall));
}

#[test]
fn test_scan_marks_broken_session_failed() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    trust_key(&config, "com.example.apex");
    PackageBuilder::new("com.example.apex", 1)
        .write_to(&session_dir(&config.sessions_dir, 3).join("base.apex"));

    let mut apexd = apexd_with_hooks(&config, RecordingHooks::default());
    apexd.submit_staged_session(3, &[]).unwrap();
    apexd.mark_staged_session_ready(3).unwrap();

    // Break the payload after submission: the boot scan re-verifies.
    std::fs::remove_file(session_dir(&config.sessions_dir, 3).join("base.apex")).unwrap();

    apexd.scan_staged_sessions();

    assert_eq!(
        StagedSession::get(&config.sessions_dir, 3).unwrap().state(),
        SessionState::ActivationFailed
    );
    let staged = find_package_files(&config.active_dir, false).unwrap_or_default();
    assert!(staged.is_empty());
}
