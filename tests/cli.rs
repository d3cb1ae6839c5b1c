use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

#[test]
fn bench_help_describes_the_harness() {
    Command::cargo_bin("machi-bench")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Append/get benchmark"));
}

#[test]
fn bounded_bench_run_reports_statistics() {
    let temp_dir = TempDir::new().unwrap();

    Command::cargo_bin("machi-bench")
        .unwrap()
        .args(["--ops", "25", "--maxlen", "10"])
        .arg("--dir")
        .arg(temp_dir.path())
        .assert()
        .success()
        .stderr(contains("append time"))
        .stderr(contains("sample time"));
}
