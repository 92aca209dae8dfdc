use std::io::Write;
use std::path::PathBuf;

use stepwise::cli::{ServeSettings, StepwiseConfig};
use tempfile::NamedTempFile;

fn config_from(yaml: &str) -> StepwiseConfig {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();
    StepwiseConfig::load(Some(f.path())).unwrap()
}

#[test]
fn load_valid_config_all_fields() {
    let cfg = config_from(
        r#"
host: "127.0.0.1"
port: 8080
store_path: "custom/runs.db"
machines_dir: "my_machines"
username: "admin"
password: "secret"
max_body: 2097152
"#,
    );

    assert_eq!(cfg.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(cfg.port, Some(8080));
    assert_eq!(cfg.store_path.as_deref(), Some("custom/runs.db"));
    assert_eq!(cfg.machines_dir.as_deref(), Some("my_machines"));
    assert_eq!(cfg.username.as_deref(), Some("admin"));
    assert_eq!(cfg.password.as_deref(), Some("secret"));
    assert_eq!(cfg.max_body, Some(2097152));
}

#[test]
fn load_partial_config() {
    let cfg = config_from("port: 9090\n");

    assert_eq!(cfg.port, Some(9090));
    assert!(cfg.host.is_none());
    assert!(cfg.store_path.is_none());
    assert!(cfg.machines_dir.is_none());
    assert!(cfg.max_body.is_none());
    assert!(cfg.credentials().is_none());
}

#[test]
fn missing_explicit_path_returns_error() {
    let result = StepwiseConfig::load(Some(std::path::Path::new("/nonexistent/stepwise.yaml")));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Config file not found")
    );
}

#[test]
fn invalid_yaml_returns_error() {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(b"port: [not, a, number]\n").unwrap();

    let err = StepwiseConfig::load(Some(f.path())).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn credentials_need_both_halves() {
    let cfg = config_from("username: admin\n");
    assert!(cfg.credentials().is_none());

    let cfg = config_from("username: admin\npassword: \"\"\n");
    assert!(cfg.credentials().is_none());

    let cfg = config_from("username: admin\npassword: pw\n");
    assert_eq!(
        cfg.credentials(),
        Some(("admin".to_string(), "pw".to_string()))
    );
}

#[test]
fn serve_settings_defaults() {
    let settings = ServeSettings::resolve(
        StepwiseConfig::default(),
        None,
        None,
        None,
        None,
        None,
        None,
        None,
    );

    assert_eq!(settings.host, "0.0.0.0");
    assert_eq!(settings.port, 3000);
    assert_eq!(settings.store_path, PathBuf::from("data/stepwise.db"));
    assert_eq!(settings.machines_dir, PathBuf::from("machines"));
    assert_eq!(settings.max_body, 1_048_576);
    assert!(settings.credentials.is_none());
}

#[test]
fn serve_settings_flags_override_config() {
    let cfg = config_from(
        r#"
host: "127.0.0.1"
port: 8080
store_path: "cfg.db"
machines_dir: "cfg_machines"
username: "cfg-user"
password: "cfg-pass"
max_body: 10
"#,
    );

    let settings = ServeSettings::resolve(
        cfg,
        None,
        Some(9000),
        Some(PathBuf::from("flag.db")),
        None,
        None,
        Some("flag-pass".to_string()),
        None,
    );

    assert_eq!(settings.host, "127.0.0.1");
    assert_eq!(settings.port, 9000);
    assert_eq!(settings.store_path, PathBuf::from("flag.db"));
    assert_eq!(settings.machines_dir, PathBuf::from("cfg_machines"));
    assert_eq!(settings.max_body, 10);
    assert_eq!(
        settings.credentials,
        Some(("cfg-user".to_string(), "flag-pass".to_string()))
    );
}
