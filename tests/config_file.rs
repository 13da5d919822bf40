// tests/config_file.rs
use std::fs;

use sentiment_gate::adapters::{build_adapters, ModelAdapter};
use sentiment_gate::config::{ModelKind, PipelineConfig};
use sentiment_gate::error::ConfigError;

#[test]
fn shipped_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/pipeline.toml");
    let cfg = PipelineConfig::load_from_file(&path).unwrap();
    assert_eq!(cfg.models.len(), 1);
    assert_eq!(cfg.models[0].kind, ModelKind::Lexicon);
    assert_eq!(build_adapters(&cfg.models).unwrap().len(), 1);
}

#[test]
fn invalid_file_reports_the_violation() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("pipeline.toml");
    fs::write(
        &p,
        r#"
[[models]]
id = "a"
weight = 0.5
kind = "lexicon"

[[models]]
id = "b"
weight = 0.4
kind = "lexicon"
"#,
    )
    .unwrap();

    let err = PipelineConfig::load_from_file(&p).unwrap_err();
    let cause = err.downcast_ref::<ConfigError>().expect("typed cause");
    assert!(matches!(cause, ConfigError::WeightSum(s) if (s - 0.9).abs() < 1e-9));
}

#[test]
fn http_model_builds_adapter() {
    let cfg = PipelineConfig::from_toml_str(
        r#"
[[models]]
id = "remote"
weight = 1.0
kind = "http"
endpoint = "http://127.0.0.1:9/score"
timeout_ms = 40
"#,
    )
    .unwrap();
    let adapters = build_adapters(&cfg.models).unwrap();
    assert_eq!(adapters[0].id(), "remote");
    assert_eq!(adapters[0].timeout(), std::time::Duration::from_millis(40));
}
