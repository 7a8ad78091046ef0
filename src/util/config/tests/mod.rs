//! Config 单元测试
//!
//! 测试配置解析、环境注入和调度器参数

use std::time::Duration;

use tempfile::TempDir;

use super::*;

#[cfg(test)]
mod runtime_config_tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.num_domains, 1);
        assert_eq!(config.verbosity, Verbosity::Normal);
        assert!(!config.block_report);
        assert!(!config.task_report);
        assert_eq!(config.memory_limit, 0);
        assert!(config.config_vars.is_empty());
    }

    #[test]
    fn test_known_keys() {
        let config = RuntimeConfig::from_pairs([
            ("numLocales", "3"),
            ("verbosity", "2"),
            ("blockreport", "1"),
            ("taskreport", "true"),
            ("workers", "2"),
            ("idle_timeout_ms", "5"),
        ])
        .unwrap();
        assert_eq!(config.num_domains, 3);
        assert_eq!(config.verbosity, Verbosity::Verbose);
        assert!(config.block_report);
        assert!(config.task_report);
        assert_eq!(config.workers, 2);
        assert_eq!(config.idle_timeout_ms, 5);
    }

    #[test]
    fn test_num_domains_alias() {
        let config = RuntimeConfig::from_pairs([("num_domains", "2")]).unwrap();
        assert_eq!(config.num_domains, 2);
    }

    #[test]
    fn test_invalid_domain_count() {
        for bad in ["0", "-1", "two", ""] {
            let err = RuntimeConfig::from_pairs([("numLocales", bad)]).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidDomainCount(_)), "{:?}", bad);
        }
    }

    #[test]
    fn test_invalid_boolean() {
        let err = RuntimeConfig::from_pairs([("taskreport", "yes")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_unknown_keys_become_config_vars() {
        let config = RuntimeConfig::from_pairs([("n", "10"), ("mode", "fast"), ("n", "20")]).unwrap();
        assert_eq!(config.config_var("n"), Some("20"));
        assert_eq!(config.config_var("mode"), Some("fast"));
        assert_eq!(config.config_vars.len(), 2);
    }

    #[test]
    fn test_scheduler_config() {
        let config =
            RuntimeConfig::from_pairs([("workers", "3"), ("sub_regions", "0"), ("idle_timeout_ms", "7")])
                .unwrap();
        let sched = config.scheduler_config();
        assert_eq!(sched.num_workers, 3);
        assert_eq!(sched.sub_regions, 1);
        assert_eq!(sched.idle_timeout, Duration::from_millis(7));

        let auto = RuntimeConfig::default().scheduler_config();
        assert!(auto.num_workers >= 1);
    }

    #[test]
    fn test_log_level_follows_verbosity() {
        assert_eq!(Verbosity::Quiet.log_level(), LogLevel::Warn);
        assert_eq!(Verbosity::Normal.log_level(), LogLevel::Info);
        assert_eq!(Verbosity::Verbose.log_level(), LogLevel::Debug);
    }

    #[test]
    fn test_serializes_to_json() {
        let config = RuntimeConfig::from_pairs([("numLocales", "2"), ("mode", "x")]).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let sparse: RuntimeConfig = serde_json::from_str(r#"{"num_domains": 4}"#).unwrap();
        assert_eq!(sparse.num_domains, 4);
        assert_eq!(sparse.sub_regions, 1);
    }
}

#[cfg(test)]
mod assignment_tests {
    use super::*;

    #[test]
    fn test_whitespace_separated() {
        let pairs = parse_assignments("a=1 b=2\n\tc=3").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_comments_and_quotes() {
        let text = "# header\nname=\"hello world\" # trailing\nother='x y'\nempty=\n";
        let pairs = parse_assignments(text).unwrap();
        assert_eq!(pairs[0], ("name".to_string(), "hello world".to_string()));
        assert_eq!(pairs[1], ("other".to_string(), "x y".to_string()));
        assert_eq!(pairs[2], ("empty".to_string(), String::new()));
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn test_malformed_assignment() {
        assert!(matches!(
            parse_assignments("justaname"),
            Err(ConfigError::MalformedAssignment(_))
        ));
        assert!(matches!(
            parse_assignments("=value"),
            Err(ConfigError::MalformedAssignment(_))
        ));
        assert!(matches!(
            parse_assignments("a=\"unterminated"),
            Err(ConfigError::MalformedAssignment(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conflux.cfg");
        fs::write(&path, "numLocales=2\ntaskreport=true\nlabel=\"two domains\"\n").unwrap();
        let mut config = RuntimeConfig::default();
        config.load_file(&path).unwrap();
        assert_eq!(config.num_domains, 2);
        assert!(config.task_report);
        assert_eq!(config.config_var("label"), Some("two domains"));
    }

    #[test]
    fn test_missing_file() {
        let err = parse_config_file("/nonexistent/conflux.cfg").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

#[cfg(test)]
mod environment_tests {
    use super::*;

    #[test]
    fn test_add_env() {
        let mut config = RuntimeConfig::default();
        config.add_env("A=1").unwrap();
        config.add_env("B=x=y").unwrap();
        assert_eq!(config.env[1], ("B".to_string(), "x=y".to_string()));
        assert!(matches!(config.add_env("novalue"), Err(ConfigError::MalformedEnv(_))));
        assert!(matches!(config.add_env("=1"), Err(ConfigError::MalformedEnv(_))));
    }

    #[test]
    fn test_apply_environment_never_overwrites() {
        let existing = format!("CONFLUX_TEST_EXISTING_{}", std::process::id());
        let fresh = format!("CONFLUX_TEST_FRESH_{}", std::process::id());
        std::env::set_var(&existing, "original");

        let mut config = RuntimeConfig::default();
        config.add_env(&format!("{}=injected", existing)).unwrap();
        config.add_env(&format!("{}=injected", fresh)).unwrap();
        let applied = config.apply_environment();

        assert_eq!(applied, vec![fresh.clone()]);
        assert_eq!(std::env::var(&existing).unwrap(), "original");
        assert_eq!(std::env::var(&fresh).unwrap(), "injected");
    }

    #[test]
    fn test_install_once() {
        let first = install(RuntimeConfig::default());
        let second = install(RuntimeConfig::default());
        // Another test in this process may have installed first.
        assert!(first.is_ok() || matches!(first, Err(ConfigError::AlreadyInstalled)));
        assert!(matches!(second, Err(ConfigError::AlreadyInstalled)));
        assert!(global().is_some());
    }
}
