use aqua_core::dataset::{DatasetStore, FileDatasetStore};
use aqua_core::episode::{Co2ClosingState, EpisodeOrigin, WINDOW_LEN};
use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

// Minimal config that keeps the dataset inside the temp dir
fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let toml = format!(
        r#"
[dataset]
dir = '{}'
file = "episodes.json"

[random]
seed = 1
{extra}
"#,
        dir.join("db").display()
    );
    let path = dir.join("aqua.toml");
    fs::write(&path, toml).unwrap();
    path
}

fn aqua(cfg: &Path) -> Command {
    let mut cmd = Command::cargo_bin("aqua").unwrap();
    cmd.env_remove("AQUA_PORT").arg("--config").arg(cfg);
    cmd
}

fn episode(close_time: i64, trough: f64) -> Co2ClosingState {
    Co2ClosingState {
        origin: EpisodeOrigin::ThisInstance,
        close_time,
        opened_seconds_ago: 1200,
        ph600_at_close: 7.0,
        ph60_offsets: vec![-0.02; WINDOW_LEN],
        temperatures: vec![25.0; WINDOW_LEN],
        daylight: vec![true; WINDOW_LEN],
        valve_open: vec![true; WINDOW_LEN],
        min_ph600_offset_after_close: trough,
    }
}

/// Dataset document as another installation would have written it.
fn write_export(path: &Path) {
    let mut store = FileDatasetStore::open(path).unwrap();
    for i in 0..5 {
        store
            .insert(&episode(1_700_000_000 + i * 3600, -0.2), i == 4)
            .unwrap();
    }
}

#[rstest]
#[case(&["--help"], 0, "Usage:", "stdout")]
#[case(&["self-check", "--simulate"], 0, "self-check ok", "stdout")]
#[case(&["self-check"], 5, "unreachable", "stderr")]
#[case(&["dataset", "stats"], 0, "0 rows", "stdout")]
#[case(&["dataset", "train"], 4, "no model path", "stderr")]
#[case(&["dataset", "import", "missing.json"], 3, "dataset", "stderr")]
fn cli_table_cases(
    #[case] args: &[&str],
    #[case] exit_code: i32,
    #[case] needle: &str,
    #[case] stream: &str,
) {
    let dir = tempdir().unwrap();
    let cfg = write_config(dir.path(), "");
    let assert = aqua(&cfg).current_dir(dir.path()).args(args).assert().code(exit_code);
    match stream {
        "stdout" => {
            assert.stdout(predicate::str::contains(needle));
        }
        "stderr" => {
            assert.stderr(predicate::str::contains(needle));
        }
        other => panic!("unknown stream: {other}"),
    }
}

#[rstest]
#[case("[controller]\nph_turn_on_off_margin = 0.0\n", "ph_turn_on_off_margin")]
#[case("[ph]\nv1 = 2.0\nv2 = 2.0\n", "ph.v1")]
#[case("[device]\nbaud = \"fast\"\n", "baud")]
fn invalid_config_exits_with_config_code(#[case] extra: &str, #[case] needle: &str) {
    let dir = tempdir().unwrap();
    let cfg = write_config(dir.path(), extra);
    aqua(&cfg)
        .args(["dataset", "stats"])
        .assert()
        .code(4)
        .stderr(
            predicate::str::contains("Invalid configuration").and(predicate::str::contains(needle)),
        );
}

#[test]
fn missing_config_file_is_a_config_error() {
    let dir = tempdir().unwrap();
    aqua(&dir.path().join("nope.toml"))
        .args(["dataset", "stats"])
        .assert()
        .code(4);
}

#[test]
fn json_errors_are_structured() {
    let dir = tempdir().unwrap();
    let cfg = write_config(dir.path(), "");
    let out = aqua(&cfg)
        .args(["--json", "dataset", "import"])
        .arg(dir.path().join("missing.json"))
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(3));
    let stderr = String::from_utf8(out.stderr).unwrap();
    let last = stderr.lines().last().unwrap();
    let v: serde_json::Value = serde_json::from_str(last).unwrap();
    assert_eq!(v["reason"], "Dataset");
    assert_eq!(v["exit_code"], 3);
    assert!(v["message"].as_str().unwrap().contains("What happened"));
}

#[test]
fn import_stats_train_and_dump() {
    let dir = tempdir().unwrap();
    let cfg = write_config(dir.path(), "");
    let export = dir.path().join("other.json");
    write_export(&export);

    aqua(&cfg)
        .args(["dataset", "import"])
        .arg(&export)
        .assert()
        .success()
        .stdout(predicate::str::contains("imported 5 rows, skipped 0"));
    aqua(&cfg)
        .args(["dataset", "import"])
        .arg(&export)
        .assert()
        .success()
        .stdout(predicate::str::contains("imported 0 rows, skipped 5"));

    let out = aqua(&cfg)
        .args(["--json", "dataset", "stats"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value =
        serde_json::from_str(String::from_utf8(out.stdout).unwrap().trim()).unwrap();
    assert_eq!(v["total"], 5);
    assert_eq!(v["training"], 4);
    assert_eq!(v["validation"], 1);
    assert_eq!(v["schema_version"], 3);

    let model = dir.path().join("model.json");
    aqua(&cfg)
        .args(["dataset", "train", "--epochs", "200", "--out"])
        .arg(&model)
        .assert()
        .success()
        .stdout(predicate::str::contains("trained on 4 rows"));
    let weights: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&model).unwrap()).unwrap();
    assert_eq!(weights["weights"].as_array().unwrap().len(), 4 * WINDOW_LEN + 3);

    aqua(&cfg)
        .args(["dataset", "dump", "--format", "csv"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("close_time,validation,y,x0,"));
}

#[test]
fn simulated_run_stops_after_duration() {
    let dir = tempdir().unwrap();
    let cfg = write_config(dir.path(), "");
    aqua(&cfg)
        .args(["run", "--simulate", "--duration-s", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("frames="));
}
