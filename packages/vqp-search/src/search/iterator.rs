//! Paged iteration over one search session.

use serde::Serialize;
use tokio::sync::mpsc;

use vqp_domain::Timestamp;

use crate::{
	Error, Result, SearchService,
	handoff::{self, TaskContext},
	search::{
		SearchRequest, SearchResults,
		params::{
			self, ITER_BATCH_SIZE_KEY, ITER_ID_KEY, ITER_LAST_BOUND_KEY, ITER_LAST_PK_KEY, ITER_V2_KEY,
			ITERATOR_KEY, LIMIT_KEY, OFFSET_KEY, TOPK_KEY,
		},
	},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IterateSummary {
	pub pages: usize,
	pub rows: usize,
	pub token: Option<String>,
	/// Snapshot every page after the first was read at.
	pub session_ts: Option<Timestamp>,
}

impl SearchService {
	/// Streams pages of one iterator session into `downstream` until the result set is exhausted,
	/// the optional total `limit` is reached, or `ctx` is interrupted.
	pub async fn iterate(
		&self,
		mut request: SearchRequest,
		ctx: &TaskContext,
		downstream: mpsc::Sender<SearchResults>,
	) -> Result<IterateSummary> {
		if !request.sub_reqs.is_empty() {
			return Err(Error::invalid("iterator is not supported for advanced search."));
		}
		if request.placeholder.nq() != 1 {
			return Err(Error::invalid("iterator only supports a single query vector."));
		}

		let total = parse_positive(&request.search_params, LIMIT_KEY)?
			.or(parse_positive(&request.search_params, TOPK_KEY)?);
		let batch_size = parse_positive(&request.search_params, ITER_BATCH_SIZE_KEY)?
			.unwrap_or(self.cfg.iterator_batch_size);

		if batch_size <= 0 {
			return Err(Error::invalid("search_iter_batch_size must be greater than zero."));
		}
		if parse_positive(&request.search_params, OFFSET_KEY)?.is_some() {
			return Err(Error::invalid("offset is not supported for iterator search."));
		}

		let search_params = &mut request.search_params;

		search_params.remove(LIMIT_KEY);
		search_params.remove(TOPK_KEY);
		search_params.insert(ITERATOR_KEY.to_string(), "true".to_string());
		search_params.insert(ITER_V2_KEY.to_string(), "true".to_string());

		let mut summary = IterateSummary::default();

		loop {
			let page_size = match total {
				Some(total) => batch_size.min(total - summary.rows as i64),
				None => batch_size,
			};

			if page_size <= 0 {
				break;
			}

			request.search_params.insert(ITER_BATCH_SIZE_KEY.to_string(), page_size.to_string());

			let page = self.search(request.clone(), ctx).await?;
			let rows = page.ids.len();

			if let Some(ts) = page.session_ts
				&& request.guarantee_timestamp == 0
			{
				request.guarantee_timestamp = ts;
				summary.session_ts = Some(ts);
			}
			if let Some(iterator) = &page.iterator {
				request.search_params.insert(ITER_ID_KEY.to_string(), iterator.token.clone());
				request
					.search_params
					.insert(ITER_LAST_BOUND_KEY.to_string(), iterator.last_bound.to_string());

				if let Some(last_pk) = &iterator.last_pk {
					request
						.search_params
						.insert(ITER_LAST_PK_KEY.to_string(), serde_json::to_string(last_pk)?);
				}

				summary.token = Some(iterator.token.clone());
			}
			if rows == 0 {
				break;
			}

			summary.pages += 1;
			summary.rows += rows;

			tracing::debug!(page = summary.pages, rows, total_rows = summary.rows, "Iterator page ready.");

			handoff::deliver(ctx, &downstream, page).await?;

			if (rows as i64) < page_size {
				break;
			}
		}

		Ok(summary)
	}
}

fn parse_positive(params: &params::SearchParams, key: &str) -> Result<Option<i64>> {
	let Some(raw) = params::get(params, key) else {
		return Ok(None);
	};
	let value = raw
		.trim()
		.parse::<i64>()
		.map_err(|_| Error::invalid(format!("{key} must be an integer, got {raw}.")))?;

	Ok((value > 0).then_some(value))
}
