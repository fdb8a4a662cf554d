//! Configuration loading and validation tests
//!
//! Behaviour of file loading, defaults and rejection of bad values. The
//! environment override rules are covered by the unit tests in `config`.

use agentmesh::config::{ConfigError, InferenceProvider, MeshConfig, RegistryBackend};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[node]
id = "hub-1"
description = "test hub"

[timeouts]
agent_timeout_secs = 45
dispatch_timeout_secs = 12

[consensus]
threshold = 0.6

[registry]
backend = "redis"
redis_url = "redis://127.0.0.1:6379"

[inference]
provider = "openai"
model = "gpt-4o"

[transport]
http_bind = "127.0.0.1:9000"
grpc_enabled = false
"#,
    );

    let config = MeshConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.node.id, "hub-1");
    assert_eq!(config.node.description, "test hub");
    assert_eq!(config.registry.backend, RegistryBackend::Redis);
    assert_eq!(config.inference.provider, InferenceProvider::Openai);
    assert_eq!(config.inference.model, "gpt-4o");
    assert_eq!(config.http_addr().unwrap().port(), 9000);
    assert!(!config.transport.grpc_enabled);
    assert_eq!(
        config.router_settings().dispatch_timeout,
        Duration::from_secs(12)
    );
}

#[test]
fn test_minimal_file_gets_defaults() {
    let temp_file = write_config("[node]\nid = \"solo\"");

    let config = MeshConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.registry.backend, RegistryBackend::Memory);
    assert_eq!(config.inference.provider, InferenceProvider::None);
    assert_eq!(config.auth.api_keys_env, "AGENT_API_KEYS");
    assert_eq!(config.timeouts.task_max_retries, 3);
    assert!(config.workers.enabled);

    let arbitrator = config.arbitrator_settings();
    assert!((arbitrator.consensus_threshold - 0.7).abs() < f64::EPSILON);
    assert_eq!(arbitrator.clarification_timeout, Duration::from_secs(10));
}

#[test]
fn test_shipped_sample_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/agentmesh.toml");

    let config = MeshConfig::load_from_file(&path).unwrap();

    assert_eq!(config.node.id, "agentmesh-hub");
    assert_eq!(config.grpc_addr().unwrap().port(), 50051);
}

#[test]
fn test_missing_file_is_read_error() {
    let result = MeshConfig::load_from_file(Path::new("/nonexistent/agentmesh.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_file = write_config("[node\nid = ");
    let result = MeshConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_node_section_is_rejected() {
    let temp_file = write_config("[consensus]\nthreshold = 0.5");
    assert!(MeshConfig::load_from_file(temp_file.path()).is_err());
}

#[test]
fn test_bad_values_are_rejected() {
    let bad_id = write_config("[node]\nid = \"has spaces\"");
    assert!(matches!(
        MeshConfig::load_from_file(bad_id.path()),
        Err(ConfigError::InvalidNodeId(_))
    ));

    let bad_bind = write_config("[node]\nid = \"hub\"\n[transport]\nhttp_bind = \"nowhere\"");
    assert!(MeshConfig::load_from_file(bad_bind.path()).is_err());

    let bad_webhook = write_config("[node]\nid = \"hub\"\n[notify]\nwebhook_url = \"not a url\"");
    assert!(MeshConfig::load_from_file(bad_webhook.path()).is_err());
}

#[test]
fn test_effective_config_round_trips_through_toml() {
    let config = MeshConfig::with_defaults("round-trip");

    let rendered = toml::to_string_pretty(&config).unwrap();
    let parsed = MeshConfig::from_toml(&rendered).unwrap();

    assert_eq!(parsed, config);
}
