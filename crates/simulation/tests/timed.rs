//! Timed-mode runs: events fire in timestamp order and node clocks advance.

use pathcheck_simulation::{PathEndCause, SimulationError, SimulationParams, SimulationRunner};
use pathcheck_test_helpers::{ping_pong, Action, Script, ScriptedTest};
use tempfile::TempDir;

fn params(dir: &TempDir) -> SimulationParams {
    SimulationParams::timed()
        .with_divergence_monitor(false)
        .with_output_path(format!("{}/", dir.path().display()))
        .with_preinitialized(vec![-1])
        .with_seed(11)
}

#[test]
fn test_ping_pong_completes_and_advances_clocks() {
    let dir = tempfile::tempdir().unwrap();
    let p = params(&dir).with_max_paths(3);
    let summary = SimulationRunner::new(p, ping_pong(3).into_arc(), 2)
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.totals.paths, 3);
    assert_eq!(summary.totals.live_paths, 3);
    assert_eq!(summary.totals.ended(PathEndCause::StoppingCondition), 3);
    let last = summary.last_path.unwrap();
    assert_eq!(last.steps, 6);
    assert!(last.time.max > 0);
    assert!(last.time.min <= last.time.avg && last.time.avg <= last.time.max);
}

#[test]
fn test_same_seed_same_timeline() {
    let run = || {
        let dir = tempfile::tempdir().unwrap();
        let p = params(&dir).with_max_paths(1);
        SimulationRunner::new(p, ping_pong(2).into_arc(), 2)
            .unwrap()
            .with_trace(true)
            .run()
            .unwrap()
            .last_path
            .unwrap()
    };
    let a = run();
    let b = run();
    assert_eq!(a.trace, b.trace);
    assert_eq!(a.time, b.time);
    assert_eq!(a.state_hash, b.state_hash);
}

#[test]
fn test_timer_fires_after_its_delay() {
    let dir = tempfile::tempdir().unwrap();
    let test = ScriptedTest::new("delayed", |node, _| {
        if node == 0 {
            Script::new()
                .on_init(Action::schedule(7, 50_000))
                .on_timer(Action::send(1, "late"))
        } else {
            Script::new()
        }
    })
    .live_after(1);
    let p = params(&dir).with_max_paths(1);
    let summary = SimulationRunner::new(p, test.into_arc(), 2)
        .unwrap()
        .with_trace(true)
        .run()
        .unwrap();
    let last = summary.last_path.unwrap();
    assert!(last.live);
    assert_eq!(last.steps, 2);
    assert!(last.trace[0].starts_with("0 "), "{:?}", last.trace);
    assert!(last.time.max >= 50_000);
}

#[test]
fn test_short_paths_are_written_as_outliers() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = params(&dir).with_max_paths(2);
    p.min_path_outlier_duration = u64::MAX / 2;
    let summary = SimulationRunner::new(p, ping_pong(1).into_arc(), 2)
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.outlier_paths.len(), 2);
    let name = summary.outlier_paths[0]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert!(name.starts_with("minoutlier0-"), "{name}");
    let text = std::fs::read_to_string(&summary.outlier_paths[1]).unwrap();
    assert!(text.starts_with("# MIN_OUTLIER::"), "{text}");
}

#[test]
fn test_overlong_path_halts() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = params(&dir);
    p.max_path_outlier_duration = 1;
    let err = SimulationRunner::new(p, ping_pong(3).into_arc(), 2)
        .unwrap()
        .run()
        .unwrap_err();
    match err {
        SimulationError::Halted { kind, path, .. } => {
            assert_eq!(kind, "PATH_TOO_LONG");
            assert!(path.unwrap().exists());
        }
        other => panic!("expected PATH_TOO_LONG, got {other}"),
    }
}

#[test]
fn test_search_prefix_files_for_live_paths() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = params(&dir).with_max_paths(2);
    p.print_search_prefix = true;
    let summary = SimulationRunner::new(p, ping_pong(1).into_arc(), 2)
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.prefix_paths.len(), 2);
    assert!(summary.prefix_paths.iter().all(|p| p.exists()));
}
