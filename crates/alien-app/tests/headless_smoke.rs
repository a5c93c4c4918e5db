use std::process::Command;

#[test]
fn headless_run_prints_monitor_json() {
    let bin = env!("CARGO_BIN_EXE_alien");
    let output = Command::new(bin)
        .args(["--steps", "12", "--particles", "500", "--report-every", "5"])
        .env("ALIEN_SEED", "42")
        .env("ALIEN_WORKERS", "2")
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to run alien binary");
    assert!(output.status.success(), "headless run failed");

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is monitor JSON");
    assert_eq!(report["timestep"], 12);
    assert!(report["num_particles"].as_u64().expect("particle count") > 0);
}

#[test]
fn settings_file_is_honoured() {
    let path = std::env::temp_dir().join(format!("alien-settings-{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{ "world_size": { "width": 64, "height": 64 }, "execution": { "device": "serial" } }"#,
    )
    .expect("write settings");

    let output = Command::new(env!("CARGO_BIN_EXE_alien"))
        .arg("--settings")
        .arg(&path)
        .args(["--steps", "3", "--particles", "50"])
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to run alien binary");
    let _ = std::fs::remove_file(&path);
    assert!(output.status.success(), "run with settings file failed");
}

#[test]
fn invalid_settings_fail_cleanly() {
    let path = std::env::temp_dir().join(format!("alien-bad-{}.json", std::process::id()));
    std::fs::write(&path, r#"{ "parameters": { "max_velocity": -3.0 } }"#).expect("write");

    let status = Command::new(env!("CARGO_BIN_EXE_alien"))
        .arg("--settings")
        .arg(&path)
        .args(["--steps", "1", "--particles", "1"])
        .env("RUST_LOG", "off")
        .status()
        .expect("failed to run alien binary");
    let _ = std::fs::remove_file(&path);
    assert!(!status.success());
}
