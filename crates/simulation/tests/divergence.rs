//! A service stuck inside an upcall is stopped by the divergence monitor.
//!
//! The stuck run aborts its process, so it runs in a child process: the
//! test binary re-executes itself with `STUCK_RUN_DIR` set.

use pathcheck_simulation::{parse_choices, SimulationParams, SimulationRunner};
use pathcheck_test_helpers::{Action, Script, ScriptedTest};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const STUCK_RUN_DIR: &str = "PATHCHECK_STUCK_RUN_DIR";

/// Node 0 draws from 4 options and messages node 1, whose delivery upcall
/// never returns. Does nothing unless started by the test below.
#[test]
fn stuck_run_child() {
    let Ok(dir) = std::env::var(STUCK_RUN_DIR) else {
        return;
    };
    let test = ScriptedTest::new("stuck", |node, _| match node {
        0 => Script::new()
            .on_init(Action::Choose(4))
            .on_init(Action::send(1, "never handled")),
        _ => Script::new().on_deliver(Action::Hang, 1),
    })
    .into_arc();
    let mut params = SimulationParams::model_check()
        .with_preinitialized(vec![-1])
        .with_divergence_monitor(true)
        .with_output_path(format!("{dir}/"));
    params.divergence_timeout = 1;
    params.divergence_assert = true;

    let result = SimulationRunner::new(params, test, 2).unwrap().run();
    panic!("stuck run returned: {result:?}");
}

#[test]
fn test_stuck_upcall_aborts_with_error_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "stuck_run_child", "--nocapture", "--test-threads=1"])
        .env(STUCK_RUN_DIR, dir.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(60);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("stuck run was not terminated");
        }
        thread::sleep(Duration::from_millis(100));
    };
    assert!(!status.success());
    // 101 is a panic: the run returned instead of being aborted.
    assert_ne!(status.code(), Some(101));

    let file = dir.path().join("errordivergence.path");
    let text = fs::read_to_string(&file).unwrap();
    assert!(text.starts_with("# DIVERGENCE::step 1 "), "{text}");
    let choices = parse_choices(&text, Path::new("errordivergence.path")).unwrap();
    assert_eq!(choices.len(), 1);
    assert_eq!(choices[0].out_of, 4);
}
