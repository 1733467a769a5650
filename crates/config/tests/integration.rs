//! Integration tests for config

#[cfg(test)]
mod tests {
    use prm_config::*;
    use prm_types::OutputFormat;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    // Mutex to ensure env var tests don't run concurrently
    static ENV_TEST_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "PRM_OUTPUT",
        "PRM_PRIORITY_LEVELS",
        "PRM_WAIT_TIMEOUT_MS",
        "PRM_MAX_USES",
        "PRM_WORKERS",
        "PRM_ROUNDS",
        "PRM_HOLD_MS",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[tokio::test]
    async fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[general]
default_output = "plain"

[manager]
priority_levels = 10
wait_timeout_ms = 500
max_uses = 40

[simulation]
workers = 3
        "#
        )
        .unwrap();

        let config = Config::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.general.default_output, OutputFormat::Plain);
        assert_eq!(config.manager.priority_levels, 10);
        assert_eq!(
            config.manager.wait_timeout(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(config.manager.max_uses, Some(40));
        assert_eq!(config.simulation.workers, 3);
        // Unset fields fall back to defaults
        assert_eq!(config.simulation.rounds, 25);
        assert_eq!(config.simulation.hold_ms, 2);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = Config::load_from_file(std::path::Path::new("/nonexistent/prm.toml")).await;
        assert!(matches!(
            result,
            Err(prm_errors::Error::Config(
                prm_errors::ConfigError::NotFound { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_path_is_an_io_error() {
        // A directory exists but cannot be read as a file
        let dir = tempfile::tempdir().unwrap();

        let result = Config::load_from_file(dir.path()).await;
        match result {
            Err(prm_errors::Error::Io { kind, .. }) => {
                assert_ne!(kind, std::io::ErrorKind::NotFound);
            }
            other => panic!("expected an I/O error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[manager\npriority_levels = ").unwrap();

        let result = Config::load_from_file(temp_file.path()).await;
        assert!(matches!(
            result,
            Err(prm_errors::Error::Config(
                prm_errors::ConfigError::ParseError { .. }
            ))
        ));
    }

    #[test]
    fn test_merge_env() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        clear_env();

        std::env::set_var("PRM_OUTPUT", "json");
        std::env::set_var("PRM_PRIORITY_LEVELS", "7");
        std::env::set_var("PRM_WAIT_TIMEOUT_MS", "1500");
        std::env::set_var("PRM_WORKERS", "12");
        std::env::set_var("PRM_MAX_USES", "300");

        let mut config = Config::default();
        config.merge_env().unwrap();

        assert_eq!(config.general.default_output, OutputFormat::Json);
        assert_eq!(config.manager.priority_levels, 7);
        assert_eq!(config.manager.wait_timeout_ms, Some(1500));
        assert_eq!(config.manager.max_uses, Some(300));
        assert_eq!(config.simulation.workers, 12);

        clear_env();
    }

    #[test]
    fn test_invalid_env_value() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        clear_env();

        std::env::set_var("PRM_PRIORITY_LEVELS", "many");

        let mut config = Config::default();
        let result = config.merge_env();
        assert!(result.is_err());

        clear_env();
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.manager.levels().unwrap().count(), 4);

        config.manager.priority_levels = 0;
        assert!(config.validate().is_err());

        config.manager.priority_levels = prm_types::MAX_LEVELS + 1;
        assert!(config.validate().is_err());

        config.manager.priority_levels = 2;
        config.manager.max_uses = Some(0);
        assert!(config.validate().is_err());

        config.manager.max_uses = Some(1);
        assert!(config.validate().is_ok());

        config.simulation.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_toml_round_trip() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("priority_levels = 4"));
        // No timeout configured, so the key is omitted
        assert!(!rendered.contains("wait_timeout_ms"));
        assert!(!rendered.contains("max_uses"));

        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.manager.priority_levels, 4);
    }
}
