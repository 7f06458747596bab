use assert_cmd::cargo::cargo_bin_cmd;
use image::{ImageFormat, Rgba, RgbaImage};
use predicates::prelude::*;
use serde_json::Value;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

fn write_sources(dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("card_{i}.png"));
            RgbaImage::from_pixel(24, 24, Rgba([40 * i as u8, 90, 200, 255]))
                .save_with_format(&path, ImageFormat::Png)
                .expect("fixture image should be written");
            path
        })
        .collect()
}

/// Small page so encoding stays quick
fn small_page_config(dir: &Path) -> PathBuf {
    let path = dir.join("export.json");
    fs::write(
        &path,
        r#"{ "page": { "width": 300, "height": 300, "margins": { "top": 20, "right": 20, "bottom": 20, "left": 20 } } }"#,
    )
    .expect("config should be written");
    path
}

fn export_json(args: &[&OsStr]) -> Value {
    let output = cargo_bin_cmd!("card-export")
        .arg("export")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("stdout should contain valid json")
}

#[test]
fn export_emits_stable_json_contract() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let sources = write_sources(temp.path(), 3);
    let config = small_page_config(temp.path());
    let out = temp.path().join("out");

    let mut args: Vec<&OsStr> = vec![
        "--output".as_ref(),
        out.as_os_str(),
        "--sequence-length".as_ref(),
        "8".as_ref(),
        "--config".as_ref(),
        config.as_os_str(),
        "--no-disk-cache".as_ref(),
    ];
    args.extend(sources.iter().map(|p| p.as_os_str()));

    let mut value = export_json(&args);
    value["output_dir"] = Value::String("<OUT>".to_owned());

    insta::assert_json_snapshot!("cli_export_three_sources", value);
    assert!(out.join("sequence_card_page_001.png").exists());
}

#[test]
fn export_reports_substitutions() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let mut sources = write_sources(temp.path(), 2);
    sources.push(temp.path().join("missing.png"));
    let config = small_page_config(temp.path());
    let out = temp.path().join("out");

    let mut args: Vec<&OsStr> = vec![
        "--output".as_ref(),
        out.as_os_str(),
        "--config".as_ref(),
        config.as_os_str(),
        "--no-disk-cache".as_ref(),
    ];
    args.extend(sources.iter().map(|p| p.as_os_str()));

    let value = export_json(&args);
    assert_eq!(value["status"], "succeeded_with_substitutions");
    assert_eq!(value["substitutions"][0]["cell"], "r0c2");
    assert_eq!(value["substitutions"][0]["page"], 1);
    assert_eq!(value["pages_written"], 1);
}

#[test]
fn export_fails_when_output_is_unusable() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let sources = write_sources(temp.path(), 1);
    let blocker = temp.path().join("blocker");
    fs::write(&blocker, b"file").expect("blocker should be written");

    cargo_bin_cmd!("card-export")
        .arg("export")
        .arg("--output")
        .arg(blocker.join("out"))
        .arg("--no-disk-cache")
        .args(&sources)
        .assert()
        .failure()
        .stderr(predicate::str::contains("export failed"));
}

#[test]
fn export_requires_sources() {
    cargo_bin_cmd!("card-export")
        .arg("export")
        .arg("--output")
        .arg("out")
        .assert()
        .failure()
        .stderr(predicate::str::contains("SOURCE"));
}

#[test]
fn export_rejects_malformed_config() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let sources = write_sources(temp.path(), 1);
    let config = temp.path().join("broken.json");
    fs::write(&config, "{ page").expect("config should be written");

    cargo_bin_cmd!("card-export")
        .arg("export")
        .arg("--output")
        .arg(temp.path().join("out"))
        .arg("--config")
        .arg(&config)
        .args(&sources)
        .assert()
        .failure()
        .stderr(predicate::str::contains("malformed config file"));
}

#[test]
fn cache_stats_and_clear_follow_exports() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let sources = write_sources(temp.path(), 3);
    let config = small_page_config(temp.path());
    let cache_dir = temp.path().join("cache");

    cargo_bin_cmd!("card-export")
        .arg("export")
        .arg("--output")
        .arg(temp.path().join("out"))
        .arg("--config")
        .arg(&config)
        .arg("--cache-dir")
        .arg(&cache_dir)
        .args(&sources)
        .assert()
        .success();

    let stats = |expected: u64| {
        let output = cargo_bin_cmd!("card-export")
            .arg("cache")
            .arg("stats")
            .arg("--cache-dir")
            .arg(&cache_dir)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let value: Value = serde_json::from_slice(&output).expect("stats should be json");
        assert_eq!(value["entry_count"], expected);
    };
    stats(3);

    cargo_bin_cmd!("card-export")
        .arg("cache")
        .arg("clear")
        .arg("--cache-dir")
        .arg(&cache_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 3 cached image(s)"));
    stats(0);
}

#[test]
fn config_write_saves_effective_settings() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let config = small_page_config(temp.path());
    let saved = temp.path().join("saved.json");

    cargo_bin_cmd!("card-export")
        .arg("config")
        .arg("--config")
        .arg(&config)
        .arg("--write")
        .arg(&saved)
        .assert()
        .success();

    let value: Value =
        serde_json::from_str(&fs::read_to_string(&saved).expect("saved config should exist"))
            .expect("saved config should be json");
    assert_eq!(value["page"]["width"], 300);
    assert_eq!(value["color"]["gamma"], 1.0);
}

#[test]
fn version_prints_package_version() {
    cargo_bin_cmd!("card-export")
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}
