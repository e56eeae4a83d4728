//! Subprocess tests for the `luab` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn luab() -> Command {
    let mut cmd = Command::cargo_bin("luab").expect("luab binary");
    cmd.env_remove("RUST_LOG").env_remove("LUAB_CONFIG");
    cmd
}

fn write_script(dir: &TempDir, name: &str, source: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, source).expect("write script");
    path.to_string_lossy().to_string()
}

#[test]
fn eval_prints_results() {
    luab()
        .args(["eval", "return 1+1"])
        .assert()
        .success()
        .stdout("2\n");
}

#[test]
fn eval_prints_each_result_on_its_own_line() {
    luab()
        .args(["eval", "return 'a', true, nil, 0.5"])
        .assert()
        .success()
        .stdout("a\ntrue\nnil\n0.5\n");
}

#[test]
fn script_errors_fail_the_process() {
    luab()
        .args(["eval", "error('kaput')"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("kaput"));
}

#[test]
fn syntax_errors_are_reported() {
    luab()
        .args(["eval", "return +"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("syntax error"));
}

#[test]
fn run_executes_files_and_prints_to_stdout() {
    let dir = TempDir::new().expect("temp dir");
    let script = write_script(&dir, "hello.lua", "#!/usr/bin/env luab\nprint('hello', 42)\n");
    luab()
        .args(["run", &script])
        .assert()
        .success()
        .stdout("hello\t42\n");
}

#[test]
fn run_reports_missing_files() {
    let dir = TempDir::new().expect("temp dir");
    let missing = dir.path().join("nope.lua");
    luab()
        .arg("run")
        .arg(&missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.lua"));
}

#[test]
fn call_passes_typed_arguments() {
    let dir = TempDir::new().expect("temp dir");
    let script = write_script(
        &dir,
        "lib.lua",
        "function describe(a, b, c) return type(a), type(b), type(c) end\n\
         function add(a, b) return a + b end\n",
    );
    luab()
        .args(["call", "--script", &script, "add", "2", "3"])
        .assert()
        .success()
        .stdout("5\n");
    luab()
        .args(["call", "--script", &script, "describe", "1", "true", "x"])
        .assert()
        .success()
        .stdout("number\nboolean\nstring\n");
}

#[test]
fn calling_unknown_functions_fails() {
    luab()
        .args(["call", "missing_function"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("calling missing_function"));
}

#[test]
fn search_paths_reach_require() {
    let dir = TempDir::new().expect("temp dir");
    write_script(&dir, "shapes.lua", "return { sides = function() return 4 end }");
    luab()
        .arg("-I")
        .arg(dir.path())
        .args(["eval", "return require('shapes').sides()"])
        .assert()
        .success()
        .stdout("4\n");
}

#[test]
fn config_files_configure_the_engine() {
    let dir = TempDir::new().expect("temp dir");
    std::fs::create_dir_all(dir.path().join("mods")).expect("mods dir");
    write_script(&dir, "mods/answer.lua", "return 42");
    let config = dir.path().join("luab.toml");
    std::fs::write(
        &config,
        format!(
            "[engine]\n[[engine.module_roots]]\npath = '{}'\nsubdirectory = 'mods'\n\n[logging]\nlevel = 'error'\n",
            dir.path().display()
        ),
    )
    .expect("write config");
    luab()
        .arg("--config")
        .arg(&config)
        .args(["eval", "return require('answer')"])
        .assert()
        .success()
        .stdout("42\n");
}

#[test]
fn broken_config_is_reported() {
    let dir = TempDir::new().expect("temp dir");
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "[engine]\ntraceback = 'maybe'\n").expect("write config");
    luab()
        .arg("--config")
        .arg(&config)
        .args(["eval", "return 1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("loading config"));
}
