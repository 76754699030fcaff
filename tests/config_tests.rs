//! Configuration and Workspace Tests
//!
//! Settings files and environment overrides, tool server configuration, and
//! the per-run workspace layout with its event journal.
//!
//! Run: cargo nextest run --test config_tests

use std::sync::Arc;
use std::time::Duration;

use datapilot::tools::{ServerTransport, ToolServersConfig};
use datapilot::{ConfigError, EnvSource, Error, HitlMode, RunContext, Settings, ToolConfigError};
use tempfile::TempDir;

// =============================================================================
// Settings
// =============================================================================

mod settings_tests {
    use super::*;

    #[tokio::test]
    async fn test_settings_file_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("datapilot.json");
        tokio::fs::write(
            &path,
            r#"{ "model": "local-llama", "api_base": "http://localhost:8080/v1", "hitl": "plan-only", "max_rounds": 12 }"#,
        )
        .await
        .unwrap();

        let settings = Settings::from_file(&path).await.unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.model, "local-llama");
        assert_eq!(settings.hitl, HitlMode::PlanOnly);
        assert_eq!(settings.interpreter, "python3");

        let config = settings.engine_config();
        assert_eq!(config.max_rounds, 12);
        assert_eq!(config.hitl_mode, HitlMode::PlanOnly);
        assert_eq!(config.code_timeout, Duration::from_secs(300));
        assert_eq!(config.stop_sequences, vec!["</code>", "</answer>"]);

        let model = settings.model_config();
        assert_eq!(model.api_base, "http://localhost:8080/v1");
    }

    #[test]
    fn test_environment_overrides() {
        let env = EnvSource::prefixed("DPTEST_OVERRIDE_");
        // SAFETY: the prefix is unique to this test.
        unsafe {
            std::env::set_var("DPTEST_OVERRIDE_MAX_ROUNDS", "7");
            std::env::set_var("DPTEST_OVERRIDE_HITL", "full");
        }

        let mut settings = Settings::default();
        settings.apply_env(&env).unwrap();
        assert_eq!(settings.max_rounds, 7);
        assert_eq!(settings.hitl, HitlMode::Full);
        assert_eq!(settings.model, Settings::default().model);
    }

    #[test]
    fn test_unparsable_override_names_variable() {
        let env = EnvSource::prefixed("DPTEST_BAD_");
        // SAFETY: the prefix is unique to this test.
        unsafe {
            std::env::set_var("DPTEST_BAD_TEMPERATURE", "warm");
        }

        let err = Settings::default().apply_env(&env).unwrap_err();
        assert!(err.to_string().contains("DPTEST_BAD_TEMPERATURE"));
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let settings = Settings {
            model: " ".into(),
            max_rounds: 0,
            api_base: "not a url".into(),
            ..Settings::default()
        };

        let err = settings.validate().unwrap_err();
        let ConfigError::Validation(errors) = &err else {
            panic!("expected a validation error, got {err:?}");
        };
        assert_eq!(errors.len(), 3);

        let err: Error = err.into();
        assert!(err.is_configuration_error());
    }
}

// =============================================================================
// Tool servers
// =============================================================================

mod tool_config_tests {
    use super::*;

    const CONFIG: &str = r#"
servers:
  files:
    transport: stdio
    command: ${FS_SERVER:-mcp-files}
    args: ["--root", "${DATA_DIR}"]
  search:
    transport: http
    url: https://search.internal/mcp
    headers:
      Authorization: "Bearer ${SEARCH_TOKEN}"
    timeout_secs: 5
  legacy:
    transport: http
    url: ${LEGACY_URL}
    enabled: false
"#;

    fn lookup(var: &str) -> Option<String> {
        match var {
            "DATA_DIR" => Some("/srv/data".into()),
            "SEARCH_TOKEN" => Some("t0k3n".into()),
            _ => None,
        }
    }

    #[test]
    fn test_resolves_variables_and_defaults() {
        let config = ToolServersConfig::from_yaml(CONFIG).unwrap();
        let specs = config.resolve_with(lookup).unwrap();

        // The disabled server with an unset variable is skipped.
        assert_eq!(specs.len(), 2);

        let files = specs.iter().find(|s| s.name == "files").unwrap();
        match &files.transport {
            ServerTransport::Stdio { command, args, .. } => {
                assert_eq!(command, "mcp-files");
                assert_eq!(args, &["--root", "/srv/data"]);
            }
            other => panic!("expected stdio transport, got {other:?}"),
        }

        let search = specs.iter().find(|s| s.name == "search").unwrap();
        assert_eq!(search.call_timeout, Duration::from_secs(5));
        match &search.transport {
            ServerTransport::Http { headers, .. } => {
                assert_eq!(headers["Authorization"], "Bearer t0k3n");
            }
            other => panic!("expected http transport, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_variable_names_server() {
        let config = ToolServersConfig::from_yaml(CONFIG).unwrap();
        let err = config.resolve_with(|_| None).unwrap_err();
        assert!(matches!(
            err,
            ToolConfigError::MissingVariable { ref server, ref var } if server == "files" && var == "DATA_DIR"
        ));
    }

    #[test]
    fn test_reserved_separator_in_server_name() {
        let config = ToolServersConfig::from_yaml(
            "servers:\n  bad__name:\n    transport: http\n    url: http://localhost:1\n",
        )
        .unwrap();
        assert!(matches!(
            config.resolve_with(|_| None),
            Err(ToolConfigError::Invalid { .. })
        ));
    }
}

// =============================================================================
// Run workspace
// =============================================================================

mod workspace_tests {
    use super::*;
    use async_trait::async_trait;
    use datapilot::llm::{LanguageModel, LlmError, LlmRequest};
    use datapilot::{Engine, EnvironmentError, ExecutionEnvironment, ExecutionResult, Outcome};
    use tokio_util::sync::CancellationToken;

    struct AnswerOnly;

    #[async_trait]
    impl LanguageModel for AnswerOnly {
        fn name(&self) -> &str {
            "answer-only"
        }

        async fn complete(&self, _request: &LlmRequest) -> Result<String, LlmError> {
            Ok("<plan>\n1. [x] Look at the question\n</plan>\n<answer>nothing to compute</answer>".into())
        }
    }

    struct Idle(bool);

    #[async_trait]
    impl ExecutionEnvironment for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn start(&mut self) -> Result<(), EnvironmentError> {
            self.0 = true;
            Ok(())
        }

        async fn execute(
            &mut self,
            _code: &str,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> ExecutionResult {
            ExecutionResult::success("")
        }

        fn is_alive(&self) -> bool {
            self.0
        }

        async fn shutdown(&mut self) -> Result<(), EnvironmentError> {
            self.0 = false;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_directories_created() {
        let dir = TempDir::new().unwrap();
        let context = RunContext::create(dir.path(), Some("run-layout".into()))
            .await
            .unwrap();

        assert!(context.run_path.ends_with("runs/run-layout"));
        for path in [
            &context.data_path,
            &context.notebooks_path,
            &context.artifacts_path,
            &context.logs_path,
        ] {
            assert!(path.is_dir(), "{} missing", path.display());
        }
        assert_eq!(
            context.artifact_path("chart.png"),
            context.artifacts_path.join("chart.png")
        );
    }

    #[tokio::test]
    async fn test_generated_run_ids_are_distinct() {
        let dir = TempDir::new().unwrap();
        let a = RunContext::create(dir.path(), None).await.unwrap();
        let b = RunContext::create(dir.path(), None).await.unwrap();
        assert_ne!(a.run_id, b.run_id);
    }

    #[tokio::test]
    async fn test_engine_journals_events_into_run_logs() {
        let dir = TempDir::new().unwrap();
        let context = Arc::new(
            RunContext::create(dir.path(), Some("run-journal".into()))
                .await
                .unwrap(),
        );

        let engine = Engine::builder()
            .llm(Arc::new(AnswerOnly))
            .environment(Idle(false))
            .context(context.clone())
            .build()
            .unwrap();
        assert_eq!(engine.run_id(), "run-journal");

        let result = engine.run("Is there anything to do?").await;
        assert_eq!(result.outcome, Outcome::Completed);

        let journal = tokio::fs::read_to_string(context.events_log_path())
            .await
            .unwrap();
        let types: Vec<String> = journal
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(types.first().map(String::as_str), Some("run_started"));
        assert_eq!(types.last().map(String::as_str), Some("run_finished"));
    }
}
