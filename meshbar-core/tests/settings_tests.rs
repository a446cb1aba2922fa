//! Settings loading: defaults, partial files, parse errors.

use std::fs;

use meshbar_core::{CoreError, ServiceDomain, Settings};
use tempfile::TempDir;

#[test]
fn missing_file_yields_defaults() {
    let root = TempDir::new().expect("tempdir");
    let settings = Settings::load(root.path()).expect("load");
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.client.max_start_retries, 3);
    assert_eq!(settings.daemon.socket_mode, 0o666);
}

#[test]
fn partial_file_fills_remaining_fields_with_defaults() {
    let root = TempDir::new().expect("tempdir");
    fs::write(
        root.path().join("settings.yaml"),
        "client:\n  poll_interval_ms: 250\n  domain: user\ndaemon:\n  engine:\n    binary_path: /opt/easytier-core\n",
    )
    .expect("write");

    let settings = Settings::load(root.path()).expect("load");
    assert_eq!(settings.client.poll_interval_ms, 250);
    assert_eq!(settings.client.domain, ServiceDomain::User);
    assert_eq!(settings.client.retry_backoff_ms, 2_000);
    assert_eq!(
        settings.daemon.engine.binary_path.as_deref(),
        Some(std::path::Path::new("/opt/easytier-core"))
    );
    assert!(settings.daemon.engine.library_path.is_none());
}

#[test]
fn malformed_file_reports_path() {
    let root = TempDir::new().expect("tempdir");
    let path = root.path().join("settings.yaml");
    fs::write(&path, "client: [unclosed").expect("write");

    let err = Settings::load(root.path()).unwrap_err();
    assert!(matches!(err, CoreError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("settings.yaml"));
}

#[test]
fn poll_interval_has_a_floor() {
    let mut settings = Settings::default();
    settings.client.poll_interval_ms = 0;
    assert_eq!(
        settings.client.poll_interval(),
        std::time::Duration::from_millis(100)
    );
}

#[test]
fn domain_parses_case_insensitively() {
    assert_eq!("System".parse::<ServiceDomain>(), Ok(ServiceDomain::System));
    assert!("root".parse::<ServiceDomain>().is_err());
}
