//! Configuration layering: embedded defaults, a settings file, then
//! `RUNNER__*` environment variables.

use runner_rl::settings::{Settings, SpawnMode, SyncMode, TargetSync};
use std::io::Write;

fn toml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn file_overrides_only_what_it_names() {
    let file = toml_file(
        r#"
        seed = 42

        [physics]
        spawn_mode = "fixed"
        spawn_interval_frames = 75.0

        [agent]
        hidden_layers = [32]
        sync_mode = "soft"
        soft_sync_tau = 0.01
        "#,
    );

    let settings = Settings::load(Some(file.path())).unwrap();
    assert_eq!(settings.seed, Some(42));
    assert_eq!(settings.physics.spawn_mode, SpawnMode::Fixed);
    assert_eq!(settings.physics.spawn_interval_frames, 75.0);
    assert_eq!(settings.physics.gravity, 0.6);
    assert_eq!(settings.agent.hidden_layers, vec![32]);
    assert_eq!(settings.agent.sync_mode, SyncMode::Soft);
    assert_eq!(settings.agent.target_sync(), TargetSync::Soft { tau: 0.01 });
    assert_eq!(settings.agent.batch_size, 64);
}

#[test]
fn invalid_file_values_are_rejected_at_load() {
    let file = toml_file(
        r#"
        [agent]
        batch_size = 0
        "#,
    );
    let err = Settings::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("batch_size"), "{err}");
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Settings::load(Some(dir.path().join("absent.toml").as_path())).is_err());
}

#[test]
fn environment_variables_override_the_file() {
    let file = toml_file(
        r#"
        [training]
        max_steps = 300
        "#,
    );
    std::env::set_var("RUNNER__TRAINING__MAX_STEPS", "900");
    let settings = Settings::load(Some(file.path()));
    std::env::remove_var("RUNNER__TRAINING__MAX_STEPS");

    assert_eq!(settings.unwrap().training.max_steps, 900);
}
