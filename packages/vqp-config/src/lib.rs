mod error;
mod types;

pub use error::{Error, Result};
pub use types::{Balancer, Config, Memory, Search, Service};

use std::{fs, path::Path};

const MAX_TOPK_CEILING: i64 = 16_384 * 4;
const MAX_GRACEFUL_TIME_MS: u64 = 24 * 60 * 60 * 1_000;

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;
	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.http_bind.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.http_bind must be non-empty.".to_string(),
		});
	}
	if cfg.service.log_level.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.log_level must be non-empty.".to_string(),
		});
	}

	validate_search(&cfg.search)?;

	let smoothing = cfg.balancer.cost_smoothing;

	if !smoothing.is_finite() {
		return Err(Error::Validation {
			message: "balancer.cost_smoothing must be a finite number.".to_string(),
		});
	}
	if smoothing <= 0.0 || smoothing > 1.0 {
		return Err(Error::Validation {
			message: "balancer.cost_smoothing must be in the range (0.0, 1.0].".to_string(),
		});
	}

	Ok(())
}

pub fn validate_search(search: &Search) -> Result<()> {
	if search.max_sub_requests == 0 {
		return Err(Error::Validation {
			message: "search.max_sub_requests must be greater than zero.".to_string(),
		});
	}

	for (label, value) in [
		("search.max_nq", search.max_nq),
		("search.max_topk", search.max_topk),
		("search.max_group_size", search.max_group_size),
		("search.iterator_batch_size", search.iterator_batch_size),
	] {
		if value <= 0 {
			return Err(Error::Validation {
				message: format!("{label} must be greater than zero."),
			});
		}
	}

	if search.max_topk > MAX_TOPK_CEILING {
		return Err(Error::Validation {
			message: format!("search.max_topk must be {MAX_TOPK_CEILING} or less."),
		});
	}
	if search.iterator_batch_size > search.max_topk {
		return Err(Error::Validation {
			message: "search.iterator_batch_size must not exceed search.max_topk.".to_string(),
		});
	}
	if search.graceful_time_ms > MAX_GRACEFUL_TIME_MS {
		return Err(Error::Validation {
			message: "search.graceful_time_ms must be 24 hours or less.".to_string(),
		});
	}
	if search.task_timeout_ms == 0 {
		return Err(Error::Validation {
			message: "search.task_timeout_ms must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg
		.memory
		.fixture
		.as_deref()
		.map(|path| path.as_os_str().to_string_lossy().trim().is_empty())
		.unwrap_or(false)
	{
		cfg.memory.fixture = None;
	}
}
