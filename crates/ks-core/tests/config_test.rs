use ks_core::config::{Config, ConfigError};

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.app_name, "kickstart");
    assert_eq!(cfg.ticker.interval_ms, 500);
    assert_eq!(cfg.ticker.span_ms, 3_600_000);
    assert!(!cfg.bootstrap.critical.continue_on_error);
    assert!(cfg.bootstrap.high_priority.continue_on_error);
    assert!(cfg.bootstrap.startup_deadline_ms.is_none());
    assert_eq!(cfg.bootstrap.shutdown_timeout_ms, 5_000);
    assert_eq!(cfg.logging.level, "info");
    assert!(!cfg.logging.is_json());
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let mut cfg = Config::default();
    cfg.bootstrap.background.task_timeout_ms = Some(2_000);
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("kickstart"));

    let parsed = Config::from_toml(&toml_str).expect("parse toml back");
    assert_eq!(parsed.ticker.interval_ms, cfg.ticker.interval_ms);
    assert_eq!(parsed.bootstrap.background.task_timeout_ms, Some(2_000));
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[ticker]
interval_ms = 250

[bootstrap.high_priority]
continue_on_error = false
task_timeout_ms = 1500
"#;
    let cfg = Config::from_toml(partial).expect("partial config parses");
    assert_eq!(cfg.ticker.interval_ms, 250);
    assert_eq!(cfg.ticker.span_ms, 3_600_000);
    assert!(!cfg.bootstrap.high_priority.continue_on_error);
    assert_eq!(
        cfg.bootstrap.high_priority.task_timeout(),
        Some(std::time::Duration::from_millis(1500))
    );
    assert!(cfg.bootstrap.background.continue_on_error);
}

#[test]
fn critical_continue_on_error_is_rejected() {
    let text = r#"
[bootstrap.critical]
continue_on_error = true
"#;
    let err = Config::from_toml(text).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn critical_section_with_only_a_timeout_parses() {
    let text = r#"
[bootstrap.critical]
task_timeout_ms = 500
"#;
    let cfg = Config::from_toml(text).unwrap();
    assert!(!cfg.bootstrap.critical.continue_on_error);
    assert_eq!(
        cfg.bootstrap.critical.task_timeout(),
        Some(std::time::Duration::from_millis(500))
    );
}

#[test]
fn unknown_log_format_is_rejected() {
    let text = r#"
[logging]
format = "xml"
"#;
    assert!(matches!(
        Config::from_toml(text),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn zero_task_timeout_is_rejected() {
    let text = r#"
[bootstrap.background]
task_timeout_ms = 0
"#;
    assert!(Config::from_toml(text).is_err());
}

#[test]
fn load_from_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load_from(dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[general]\napp_name = \"demo\"\n").unwrap();
    let cfg = Config::load_from(&path).expect("load");
    assert_eq!(cfg.general.app_name, "demo");
}
