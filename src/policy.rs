//! Wraps every handler invocation with a method allowlist, a path
//! allowlist, a sliding-window rate limit with optional burst sub-window,
//! and a concurrency ceiling, then emits one audit record regardless of
//! outcome.
//!
//! The path-allowlist wildcard matching extends an exact-or-`"*"` pattern
//! to `*`-as-substring-wildcard; other regex metacharacters are literal.

use crate::error::PolicyError;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct PolicyConfig {
	pub allowed_methods: Vec<String>,
	pub allowed_paths: Vec<String>,
	pub rate_limit: u32,
	pub rate_window_ms: u64,
	pub rate_limit_burst: Option<u32>,
	pub concurrency: Option<usize>,
	pub concurrency_per_path: Option<usize>,
}

impl Default for PolicyConfig {
	fn default() -> Self {
		Self {
			allowed_methods: vec!["GET", "POST", "PUT", "PATCH", "DELETE"]
				.into_iter()
				.map(String::from)
				.collect(),
			allowed_paths: vec!["*".to_string()],
			rate_limit: 60,
			rate_window_ms: 60_000,
			rate_limit_burst: None,
			concurrency: None,
			concurrency_per_path: None,
		}
	}
}

/// Matches `*` as a substring wildcard; every other character (including
/// other regex metacharacters) is literal.
fn wildcard_matches(pattern: &str, candidate: &str) -> bool {
	if pattern == "*" {
		return true;
	}
	let parts: Vec<&str> = pattern.split('*').collect();
	if parts.len() == 1 {
		return pattern == candidate;
	}
	let mut rest = candidate;
	for (i, part) in parts.iter().enumerate() {
		if part.is_empty() {
			continue;
		}
		if i == 0 {
			if !rest.starts_with(part) {
				return false;
			}
			rest = &rest[part.len()..];
		} else if i == parts.len() - 1 {
			return rest.ends_with(part);
		} else if let Some(pos) = rest.find(part) {
			rest = &rest[pos + part.len()..];
		} else {
			return false;
		}
	}
	true
}

/// Process-wide sliding-window counter. Lock-free: a window-start
/// timestamp and an in-window count, both mutated via compare-and-swap so
/// concurrent callers never corrupt the counter, only ever race into a
/// fresh window reset (benign: at most one reset wins).
struct SlidingWindow {
	window_start_ms: AtomicI64,
	count: AtomicU32,
	window_ms: u64,
	limit: u32,
}

impl SlidingWindow {
	fn new(limit: u32, window_ms: u64) -> Self {
		Self {
			window_start_ms: AtomicI64::new(now_ms()),
			count: AtomicU32::new(0),
			window_ms,
			limit,
		}
	}

	fn try_acquire(&self) -> bool {
		let now = now_ms();
		loop {
			let start = self.window_start_ms.load(Ordering::Acquire);
			if now - start >= self.window_ms as i64 {
				// Window has elapsed: whoever wins the CAS resets it.
				if self
					.window_start_ms
					.compare_exchange(start, now, Ordering::AcqRel, Ordering::Acquire)
					.is_ok()
				{
					self.count.store(0, Ordering::Release);
				}
				continue;
			}
			let current = self.count.load(Ordering::Acquire);
			if current >= self.limit {
				return false;
			}
			if self
				.count
				.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				return true;
			}
		}
	}
}

fn now_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as i64
}

pub struct RateLimiter {
	window: SlidingWindow,
	burst: Option<SlidingWindow>,
}

impl RateLimiter {
	pub fn new(config: &PolicyConfig) -> Self {
		Self {
			window: SlidingWindow::new(config.rate_limit, config.rate_window_ms),
			burst: config
				.rate_limit_burst
				.map(|burst_limit| SlidingWindow::new(burst_limit, 1_000)),
		}
	}

	fn try_acquire(&self) -> bool {
		if let Some(burst) = &self.burst {
			if !burst.try_acquire() {
				return false;
			}
		}
		self.window.try_acquire()
	}
}

/// Per-process and per-path-template concurrency ceilings.
pub struct ConcurrencyLimiter {
	global: Option<Arc<Semaphore>>,
	per_path: Option<Arc<tokio::sync::RwLock<std::collections::HashMap<String, Arc<Semaphore>>>>>,
	per_path_limit: usize,
}

impl ConcurrencyLimiter {
	pub fn new(config: &PolicyConfig) -> Self {
		Self {
			global: config.concurrency.map(|n| Arc::new(Semaphore::new(n))),
			per_path: config
				.concurrency_per_path
				.map(|_| Arc::new(tokio::sync::RwLock::new(std::collections::HashMap::new()))),
			per_path_limit: config.concurrency_per_path.unwrap_or(0),
		}
	}

	async fn acquire(&self, path_template: &str) -> Result<ConcurrencyGuard, PolicyError> {
		let global_permit = match &self.global {
			Some(sem) => Some(
				sem
					.clone()
					.try_acquire_owned()
					.map_err(|_| PolicyError::ConcurrencyLimited)?,
			),
			None => None,
		};
		let path_permit = match &self.per_path {
			Some(map) => {
				let semaphore = {
					let mut guard = map.write().await;
					guard
						.entry(path_template.to_string())
						.or_insert_with(|| Arc::new(Semaphore::new(self.per_path_limit)))
						.clone()
				};
				Some(
					semaphore
						.try_acquire_owned()
						.map_err(|_| PolicyError::ConcurrencyLimited)?,
				)
			},
			None => None,
		};
		Ok(ConcurrencyGuard {
			_global: global_permit,
			_path: path_permit,
		})
	}
}

struct ConcurrencyGuard {
	_global: Option<tokio::sync::OwnedSemaphorePermit>,
	_path: Option<tokio::sync::OwnedSemaphorePermit>,
}

/// A privacy-preserving audit record: no headers, bodies, or query values.
#[derive(Debug, serde::Serialize)]
pub struct AuditRecord {
	pub timestamp: u64,
	pub method: String,
	#[serde(rename = "pathTemplate")]
	pub path_template: String,
	#[serde(rename = "hasQuery")]
	pub has_query: bool,
	pub status: u16,
	pub ok: bool,
	#[serde(rename = "durationMs")]
	pub duration_ms: u64,
}

pub trait AuditSink: Send + Sync {
	fn emit(&self, record: &AuditRecord);
}

pub struct NoopAuditSink;
impl AuditSink for NoopAuditSink {
	fn emit(&self, _record: &AuditRecord) {}
}

/// Audit line format selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
	Json,
	Tsv,
}

impl std::str::FromStr for LogFormat {
	type Err = ();
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"tsv" => Ok(LogFormat::Tsv),
			"json" => Ok(LogFormat::Json),
			_ => Err(()),
		}
	}
}

fn format_record(record: &AuditRecord, format: LogFormat) -> String {
	match format {
		LogFormat::Json => serde_json::to_string(record).unwrap_or_default(),
		LogFormat::Tsv => format!(
			"{}\t{}\t{}\t{}\t{}\t{}\t{}",
			record.timestamp,
			record.method,
			record.path_template,
			record.has_query,
			record.status,
			record.ok,
			record.duration_ms
		),
	}
}

/// A rotating-file audit sink: appends one line per call, and once the
/// file would exceed `max_size_bytes` rotates `path` -> `path.1` ->
/// `path.2` ... up to `max_generations`, pruning the oldest. Rotation and
/// the write it follows share one lock with the serialised writer.
pub struct FileAuditSink {
	inner: std::sync::Mutex<FileAuditSinkInner>,
}

struct FileAuditSinkInner {
	path: std::path::PathBuf,
	max_size_bytes: u64,
	max_generations: u32,
	format: LogFormat,
	file: std::fs::File,
	current_size: u64,
}

impl FileAuditSink {
	pub fn open(
		path: impl Into<std::path::PathBuf>,
		max_size_bytes: u64,
		max_generations: u32,
		format: LogFormat,
	) -> std::io::Result<Self> {
		let path = path.into();
		let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
		let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
		Ok(Self {
			inner: std::sync::Mutex::new(FileAuditSinkInner {
				path,
				max_size_bytes,
				max_generations,
				format,
				file,
				current_size,
			}),
		})
	}
}

impl AuditSink for FileAuditSink {
	fn emit(&self, record: &AuditRecord) {
		let Ok(mut inner) = self.inner.lock() else { return };
		let line = format_record(record, inner.format);
		let line_len = line.len() as u64 + 1;
		if inner.max_size_bytes > 0 && inner.current_size + line_len > inner.max_size_bytes {
			inner.rotate();
		}
		use std::io::Write;
		if writeln!(inner.file, "{line}").is_ok() {
			inner.current_size += line_len;
		}
	}
}

impl FileAuditSinkInner {
	fn rotate(&mut self) {
		if self.max_generations == 0 {
			// No history kept: truncate in place instead of renaming.
			if let Ok(file) = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&self.path) {
				self.file = file;
				self.current_size = 0;
			}
			return;
		}
		for generation in (1..self.max_generations).rev() {
			let from = generation_path(&self.path, generation);
			let to = generation_path(&self.path, generation + 1);
			let _ = std::fs::rename(&from, &to);
		}
		let _ = std::fs::rename(&self.path, generation_path(&self.path, 1));
		if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&self.path) {
			self.file = file;
			self.current_size = 0;
		}
	}
}

fn generation_path(base: &std::path::Path, generation: u32) -> std::path::PathBuf {
	let mut name = base.as_os_str().to_os_string();
	name.push(format!(".{generation}"));
	std::path::PathBuf::from(name)
}

pub struct PolicyEngine {
	config: PolicyConfig,
	rate_limiter: RateLimiter,
	concurrency: ConcurrencyLimiter,
	audit_sink: Box<dyn AuditSink>,
	total_calls: AtomicU64,
}

impl PolicyEngine {
	pub fn new(config: PolicyConfig, audit_sink: Box<dyn AuditSink>) -> Self {
		Self {
			rate_limiter: RateLimiter::new(&config),
			concurrency: ConcurrencyLimiter::new(&config),
			config,
			audit_sink,
			total_calls: AtomicU64::new(0),
		}
	}

	pub fn total_calls(&self) -> u64 {
		self.total_calls.load(Ordering::Relaxed)
	}

	/// Enforcement order: method, then path, then rate limit, then
	/// concurrency. The audit record fires on every exit path below,
	/// including a policy rejection before any upstream call.
	pub async fn enforce_and_call<F, Fut, T, E>(
		&self,
		method: &str,
		path_template: &str,
		has_query: bool,
		call: F,
	) -> Result<T, PolicyOutcome<E>>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = Result<T, E>>,
		E: HasStatus,
	{
		self.total_calls.fetch_add(1, Ordering::Relaxed);
		let start = std::time::Instant::now();

		if !self.config.allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
			self.audit(method, path_template, has_query, 0, false, start);
			return Err(PolicyOutcome::Policy(PolicyError::MethodNotAllowed(method.to_string())));
		}
		if !self.config.allowed_paths.iter().any(|p| wildcard_matches(p, path_template)) {
			self.audit(method, path_template, has_query, 0, false, start);
			return Err(PolicyOutcome::Policy(PolicyError::PathNotAllowed(
				path_template.to_string(),
			)));
		}
		if !self.rate_limiter.try_acquire() {
			self.audit(method, path_template, has_query, 0, false, start);
			return Err(PolicyOutcome::Policy(PolicyError::RateLimited {
				limit: self.config.rate_limit,
				window_ms: self.config.rate_window_ms,
			}));
		}
		let _guard = match self.concurrency.acquire(path_template).await {
			Ok(guard) => guard,
			Err(err) => {
				self.audit(method, path_template, has_query, 0, false, start);
				return Err(PolicyOutcome::Policy(err));
			},
		};

		match call().await {
			Ok(value) => {
				self.audit(method, path_template, has_query, 200, true, start);
				Ok(value)
			},
			Err(err) => {
				let status = err.status();
				self.audit(method, path_template, has_query, status, false, start);
				Err(PolicyOutcome::Call(err))
			},
		}
	}

	fn audit(&self, method: &str, path_template: &str, has_query: bool, status: u16, ok: bool, start: std::time::Instant) {
		let record = AuditRecord {
			timestamp: now_ms().max(0) as u64,
			method: method.to_string(),
			path_template: path_template.to_string(),
			has_query,
			status,
			ok,
			duration_ms: start.elapsed().as_millis() as u64,
		};
		self.audit_sink.emit(&record);
	}
}

/// Lets the policy wrapper read a status code out of the inner error type
/// without depending on `CallError` directly (kept decoupled so policy.rs
/// has no dependency on tool.rs).
pub trait HasStatus {
	fn status(&self) -> u16;
}

pub enum PolicyOutcome<E> {
	Policy(PolicyError),
	Call(E),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wildcard_matches_substring_star() {
		assert!(wildcard_matches("*", "/anything"));
		assert!(wildcard_matches("/users/*", "/users/123"));
		assert!(!wildcard_matches("/users/*", "/accounts/123"));
		assert!(wildcard_matches("/users/123", "/users/123"));
	}

	#[test]
	fn wildcard_other_metacharacters_are_literal() {
		assert!(!wildcard_matches("/users/[id]", "/users/123"));
		assert!(wildcard_matches("/users/[id]", "/users/[id]"));
	}

	#[test]
	fn sliding_window_blocks_after_limit_and_resets() {
		let window = SlidingWindow::new(2, 50);
		assert!(window.try_acquire());
		assert!(window.try_acquire());
		assert!(!window.try_acquire());
		std::thread::sleep(Duration::from_millis(60));
		assert!(window.try_acquire());
	}

	#[test]
	fn file_audit_sink_rotates_by_size_and_prunes_oldest() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("audit.log");
		let sink = FileAuditSink::open(&path, 120, 2, LogFormat::Json).unwrap();

		for i in 0..20 {
			sink.emit(&AuditRecord {
				timestamp: i,
				method: "GET".into(),
				path_template: "/users".into(),
				has_query: false,
				status: 200,
				ok: true,
				duration_ms: 1,
			});
		}

		assert!(path.exists());
		assert!(generation_path(&path, 1).exists());
		// Only 2 generations are kept: nothing ever reaches generation 3.
		assert!(!generation_path(&path, 3).exists());
	}

	#[test]
	fn tsv_format_is_tab_separated() {
		let record = AuditRecord {
			timestamp: 1,
			method: "GET".into(),
			path_template: "/users".into(),
			has_query: true,
			status: 200,
			ok: true,
			duration_ms: 5,
		};
		let line = format_record(&record, LogFormat::Tsv);
		assert_eq!(line, "1\tGET\t/users\ttrue\t200\ttrue\t5");
	}

	#[tokio::test]
	async fn concurrency_limiter_rejects_past_ceiling() {
		let config = PolicyConfig {
			concurrency: Some(1),
			..Default::default()
		};
		let limiter = ConcurrencyLimiter::new(&config);
		let _first = limiter.acquire("/x").await.unwrap();
		let second = limiter.acquire("/x").await;
		assert!(matches!(second, Err(PolicyError::ConcurrencyLimited)));
	}
}
