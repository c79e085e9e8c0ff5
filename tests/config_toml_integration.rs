use taskflow::cli::EngineConfig;
use taskflow::{StorageBackend, TaskPriority};
use tempfile::NamedTempFile;

#[test]
fn test_config_serialization_roundtrip() {
    let mut original_config = EngineConfig::default();
    original_config.task_manager.max_concurrent_tasks = 6;
    original_config.task_manager.default_priority = TaskPriority::Low;
    original_config.storage.backend = StorageBackend::Memory;

    let toml_str =
        toml::to_string_pretty(&original_config).expect("Should be able to serialize config");
    assert!(!toml_str.is_empty(), "TOML string should not be empty");

    let deserialized_config: EngineConfig =
        toml::from_str(&toml_str).expect("Should be able to deserialize TOML string");

    assert_eq!(deserialized_config.task_manager.max_concurrent_tasks, 6);
    assert_eq!(
        deserialized_config.task_manager.default_priority,
        TaskPriority::Low
    );
    assert_eq!(deserialized_config.storage.backend, StorageBackend::Memory);
    assert_eq!(
        original_config.coordinator.max_active_workflows,
        deserialized_config.coordinator.max_active_workflows
    );
}

#[test]
fn test_config_file_operations() {
    let original_config = EngineConfig::default();

    let temp_file = NamedTempFile::new().expect("Should be able to create temporary file");
    let temp_path = temp_file.path();

    original_config
        .to_toml_file(temp_path)
        .expect("Should be able to save config to file");
    let loaded_config =
        EngineConfig::from_toml_file(temp_path).expect("Should be able to load config from file");

    assert_eq!(
        original_config.task_manager.cpu_threshold,
        loaded_config.task_manager.cpu_threshold
    );
    assert_eq!(original_config.logging.filter, loaded_config.logging.filter);
    assert_eq!(loaded_config.storage.backend, StorageBackend::None);
}

#[test]
fn test_config_toml_structure() {
    let toml_str = toml::to_string_pretty(&EngineConfig::default())
        .expect("Should be able to serialize config");

    assert!(toml_str.contains("[task_manager]"), "Should contain task_manager section");
    assert!(toml_str.contains("[coordinator]"), "Should contain coordinator section");
    assert!(toml_str.contains("[storage]"), "Should contain storage section");
    assert!(toml_str.contains("[logging]"), "Should contain logging section");

    assert!(toml_str.contains("max_concurrent_tasks"), "Should contain max_concurrent_tasks");
    assert!(toml_str.contains("max_active_workflows"), "Should contain max_active_workflows");
}

#[test]
fn test_empty_file_is_all_defaults() {
    let config: EngineConfig = toml::from_str("").expect("Empty config should parse");
    assert_eq!(config.task_manager.max_concurrent_tasks, 3);
    assert_eq!(config.task_manager.default_priority, TaskPriority::Normal);
    assert!(config.task_manager.resource_check_enabled);
    assert_eq!(config.coordinator.default_step_timeout_ms, None);
}

#[test]
fn test_config_error_handling() {
    let invalid_priority = "[task_manager]\ndefault_priority = 9\n";
    assert!(toml::from_str::<EngineConfig>(invalid_priority).is_err());

    let invalid_backend = "[storage]\nbackend = \"postgres\"\n";
    assert!(toml::from_str::<EngineConfig>(invalid_backend).is_err());

    let temp_file = NamedTempFile::new().unwrap();
    std::fs::write(temp_file.path(), "this is not = = toml").unwrap();
    let err = EngineConfig::from_toml_file(temp_file.path()).unwrap_err();
    assert!(err.to_string().contains("Invalid config file"));
}
