use std::{
	env, fs,
	path::PathBuf,
	sync::atomic::{AtomicU64, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};

use toml::Value;

use vqp_config::Config;

const SAMPLE_CONFIG_TEMPLATE_TOML: &str = include_str!("fixtures/sample_config.template.toml");

fn sample_toml_with(section: &str, key: &str, value: Value) -> String {
	let mut root: Value =
		toml::from_str(SAMPLE_CONFIG_TEMPLATE_TOML).expect("Failed to parse template config.");
	let table = root
		.as_table_mut()
		.expect("Template config must be a table.")
		.get_mut(section)
		.and_then(Value::as_table_mut)
		.expect("Template config must include the requested section.");

	table.insert(key.to_string(), value);

	toml::to_string(&root).expect("Failed to render template config.")
}

fn write_temp_config(payload: String) -> PathBuf {
	static COUNTER: AtomicU64 = AtomicU64::new(0);

	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("System time must be valid.")
		.as_nanos();
	let ordinal = COUNTER.fetch_add(1, Ordering::SeqCst);
	let pid = std::process::id();
	let mut path = env::temp_dir();

	path.push(format!("vqp_config_test_{nanos}_{pid}_{ordinal}.toml"));

	fs::write(&path, payload).expect("Failed to write test config.");

	path
}

fn base_config() -> Config {
	toml::from_str(SAMPLE_CONFIG_TEMPLATE_TOML).expect("Failed to parse test config.")
}

#[test]
fn sample_config_loads_and_drops_blank_fixture() {
	let path = write_temp_config(SAMPLE_CONFIG_TEMPLATE_TOML.to_string());
	let result = vqp_config::load(&path);

	fs::remove_file(&path).expect("Failed to remove test config.");

	let cfg = result.expect("Sample config must load.");

	assert!(cfg.memory.fixture.is_none());
	assert_eq!(cfg.search.max_sub_requests, 1_024);
	assert_eq!(cfg.search.graceful_time_ms, 5_000);
}

#[test]
fn missing_file_reports_read_error() {
	let err = vqp_config::load(&PathBuf::from("/definitely/not/here/vqp.toml"))
		.expect_err("Expected read error.");

	assert!(matches!(err, vqp_config::Error::ReadConfig { .. }), "Unexpected error: {err}");
}

#[test]
fn malformed_toml_reports_parse_error() {
	let path = write_temp_config("[service\nhttp_bind = 1".to_string());
	let result = vqp_config::load(&path);

	fs::remove_file(&path).expect("Failed to remove test config.");

	let err = result.expect_err("Expected parse error.");

	assert!(matches!(err, vqp_config::Error::ParseConfig { .. }), "Unexpected error: {err}");
}

#[test]
fn max_nq_must_be_positive() {
	let payload = sample_toml_with("search", "max_nq", Value::Integer(0));
	let path = write_temp_config(payload);
	let result = vqp_config::load(&path);

	fs::remove_file(&path).expect("Failed to remove test config.");

	let err = result.expect_err("Expected max_nq validation error.");

	assert!(
		err.to_string().contains("search.max_nq must be greater than zero."),
		"Unexpected error: {err}"
	);
}

#[test]
fn cost_smoothing_must_be_in_range() {
	let mut cfg = base_config();

	cfg.balancer.cost_smoothing = 1.5;

	let err = vqp_config::validate(&cfg).expect_err("Expected smoothing validation error.");

	assert!(
		err.to_string().contains("balancer.cost_smoothing must be in the range (0.0, 1.0]."),
		"Unexpected error: {err}"
	);

	cfg.balancer.cost_smoothing = f32::NAN;

	let err = vqp_config::validate(&cfg).expect_err("Expected finite validation error.");

	assert!(err.to_string().contains("must be a finite number"), "Unexpected error: {err}");
}

#[test]
fn iterator_batch_size_is_bounded_by_max_topk() {
	let mut cfg = base_config();

	cfg.search.iterator_batch_size = cfg.search.max_topk + 1;

	let err = vqp_config::validate(&cfg).expect_err("Expected batch size validation error.");

	assert!(
		err.to_string().contains("search.iterator_batch_size must not exceed search.max_topk."),
		"Unexpected error: {err}"
	);
}

#[test]
fn graceful_time_is_capped() {
	let mut cfg = base_config();

	cfg.search.graceful_time_ms = 25 * 60 * 60 * 1_000;

	assert!(vqp_config::validate(&cfg).is_err());

	cfg.search.graceful_time_ms = 0;

	assert!(vqp_config::validate(&cfg).is_ok());
}

#[test]
fn blank_bind_is_rejected() {
	let payload = sample_toml_with("service", "http_bind", Value::String("  ".to_string()));
	let path = write_temp_config(payload);
	let result = vqp_config::load(&path);

	fs::remove_file(&path).expect("Failed to remove test config.");

	let err = result.expect_err("Expected bind validation error.");

	assert!(
		err.to_string().contains("service.http_bind must be non-empty."),
		"Unexpected error: {err}"
	);
}
