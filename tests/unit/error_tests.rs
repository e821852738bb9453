//! Unit tests for the shared error type.

use chat_courier::AppError;

#[test]
fn display_includes_category_prefix() {
    assert_eq!(
        AppError::Config("bad toml".into()).to_string(),
        "config: bad toml"
    );
    assert_eq!(
        AppError::Persistence("disk full".into()).to_string(),
        "persistence: disk full"
    );
    assert_eq!(
        AppError::Driver("send failed".into()).to_string(),
        "driver: send failed"
    );
    assert_eq!(
        AppError::Detection("no baseline".into()).to_string(),
        "detection: no baseline"
    );
    assert_eq!(
        AppError::NotFound("task 42".into()).to_string(),
        "not found: task 42"
    );
    assert_eq!(AppError::Io("broken pipe".into()).to_string(), "io: broken pipe");
}

#[test]
fn json_errors_map_to_persistence() {
    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: AppError = json_err.into();
    assert!(matches!(err, AppError::Persistence(_)), "got {err:?}");
}

#[test]
fn io_errors_map_to_io() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: AppError = io_err.into();
    assert!(matches!(err, AppError::Io(_)), "got {err:?}");
}

#[test]
fn toml_errors_map_to_config() {
    let toml_err = toml::from_str::<toml::Value>("= nonsense").unwrap_err();
    let err: AppError = toml_err.into();
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn implements_std_error() {
    fn assert_error<E: std::error::Error>(_err: &E) {}
    assert_error(&AppError::Config("x".into()));
}
