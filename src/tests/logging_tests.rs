use super::*;

#[test]
fn test_init_creates_log_file_and_tolerates_repeat_calls() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("engine.log");
    let config = LoggingConfig {
        filter: "debug".to_string(),
        file: Some(path.clone()),
    };

    init(&config).unwrap();
    init(&config).unwrap();
    assert!(path.exists());
}

#[test]
fn test_init_reports_unopenable_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoggingConfig {
        filter: "info".to_string(),
        file: Some(dir.path().to_path_buf()),
    };

    let err = init(&config).unwrap_err();
    assert!(err.to_string().contains("Failed to open log file"));
}
