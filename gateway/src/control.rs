//! Cached config loader (§4.15), data-plane side only.
//!
//! The transport to an actual control-plane peer is sketched behind
//! [`ControlStream`] rather than a concrete gRPC client — this crate has
//! no generated xDS-equivalent stubs to build one from (see the
//! teacher's `control::grpc_connector`/`GrpcChannel`, which wires a real
//! `tonic` channel up to exactly this kind of bidirectional stream). What
//! this module fully implements is the part that actually "drives the
//! local cache" per the non-goal carve-out: hash verification, the
//! write-temp-fsync-rename persistence, and the atomics tracking the
//! last-known-good version — grounded in the same trait-seam shape
//! `engines::circuit_breaker::distributed::Store` uses for its own
//! external dependency.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fabric_core::GatewayError;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const CONFIG_FILE: &str = "config.yaml";
const NODE_ID_FILE: &str = "node_id";

/// Outbound message on the control-plane stream (§6 "client→server
/// messages").
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
	Connect {
		node_id: Uuid,
		version: u64,
		hostname: String,
		config_hash: u64,
	},
	Heartbeat {
		node_id: Uuid,
		config_version: u64,
		config_hash: u64,
		status: String,
		timestamp_unix: u64,
	},
}

/// Inbound message on the control-plane stream (§6 "server→client
/// sends `ConfigUpdate{version, yaml, hash, source}`").
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
	pub version: u64,
	pub yaml: String,
	pub hash: u64,
	pub source: String,
}

/// The bidirectional stream seam a deployment wires up to its real
/// control-plane client. `recv` returning `Ok(None)` signals a clean
/// stream close (triggers reconnect with backoff); an `Err` signals a
/// transport failure (same).
#[async_trait]
pub trait ControlStream: Send + Sync {
	async fn send(&mut self, msg: ClientMessage) -> Result<(), GatewayError>;
	async fn recv(&mut self) -> Result<Option<ConfigUpdate>, GatewayError>;
}

/// The reload entry point: parses `yaml`, overlays this node's own
/// cluster identity, validates, and swaps it in. Kept abstract so this
/// crate never has an opinion on the config schema itself (§1 "configuration
/// parsing and hot-reload... are external collaborators").
#[async_trait]
pub trait ReloadSink: Send + Sync {
	async fn reload(&self, yaml: &str) -> Result<(), GatewayError>;
}

fn xxh64(bytes: &[u8]) -> u64 {
	xxhash_rust::xxh64::xxh64(bytes, 0)
}

/// Write `bytes` to `path` via `.tmp` + fsync + rename (§6 "atomic write
/// via `.tmp` + fsync + rename"), so a crash mid-write can never leave a
/// torn config file in place of the last-known-good one.
async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
	let tmp = path.with_extension("tmp");
	let mut file = tokio::fs::File::create(&tmp).await?;
	file.write_all(bytes).await?;
	file.sync_all().await?;
	tokio::fs::rename(&tmp, path).await?;
	Ok(())
}

/// Last-known-good config state plus the disk cache it is persisted to.
/// One instance per process; `version`/`hash`/`has_config` start at
/// `0`/`0`/`false` until the first successful
/// [`CachedConfigLoader::apply_update`] (a disk-cache bootstrap reload
/// never advances them, matching scenario 6's "version remains 0" before
/// any `ConfigUpdate` has been verified and applied). `has_config` is the
/// fourth field DP-1 names alongside `version`/`hash`/the cached file: a
/// rejected update must leave it exactly as it was, even on the very
/// first update this process ever sees.
pub struct CachedConfigLoader {
	cache_dir: PathBuf,
	node_id: Uuid,
	version: AtomicU64,
	hash: AtomicU64,
	has_config: AtomicBool,
	last_reload_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Snapshot {
	pub node_id: Uuid,
	pub version: u64,
	pub hash: u64,
	pub has_config: bool,
	pub last_reload_error: Option<String>,
}

impl CachedConfigLoader {
	/// Loads or mints `<cache_dir>/node_id` (§6 "on-disk state"). Does
	/// not touch `config.yaml` — call [`Self::bootstrap`] for that, since
	/// bootstrapping requires a [`ReloadSink`] this constructor doesn't
	/// have.
	pub async fn open(cache_dir: impl Into<PathBuf>) -> Result<Self, GatewayError> {
		let cache_dir = cache_dir.into();
		tokio::fs::create_dir_all(&cache_dir)
			.await
			.map_err(|e| GatewayError::Internal(format!("control: cache_dir {}: {e}", cache_dir.display())))?;
		let node_id_path = cache_dir.join(NODE_ID_FILE);
		let node_id = match tokio::fs::read_to_string(&node_id_path).await {
			Ok(s) => s.trim().parse().unwrap_or_else(|_| Uuid::new_v4()),
			Err(_) => {
				let id = Uuid::new_v4();
				// Best-effort: a failure to persist a fresh node id is not
				// fatal, it is simply re-minted (and re-written) next boot.
				let _ = atomic_write(&node_id_path, id.to_string().as_bytes()).await;
				id
			},
		};
		Ok(CachedConfigLoader {
			cache_dir,
			node_id,
			version: AtomicU64::new(0),
			hash: AtomicU64::new(0),
			has_config: AtomicBool::new(false),
			last_reload_error: Mutex::new(None),
		})
	}

	fn config_path(&self) -> PathBuf {
		self.cache_dir.join(CONFIG_FILE)
	}

	/// On startup: try the disk cache for a last-known-good config and
	/// invoke `reload` with it. A missing or unreadable cache is not an
	/// error — there is simply nothing to bootstrap from yet (§4.15 "try
	/// disk cache for last-known-good").
	pub async fn bootstrap(&self, reload: &dyn ReloadSink) -> Result<bool, GatewayError> {
		let bytes = match tokio::fs::read(self.config_path()).await {
			Ok(b) => b,
			Err(_) => return Ok(false),
		};
		let yaml = String::from_utf8_lossy(&bytes);
		match reload.reload(&yaml).await {
			Ok(()) => {
				*self.last_reload_error.lock().expect("control lock poisoned") = None;
				self.has_config.store(true, Ordering::Release);
				Ok(true)
			},
			Err(e) => {
				*self.last_reload_error.lock().expect("control lock poisoned") = Some(e.to_string());
				Err(e)
			},
		}
	}

	pub fn snapshot(&self) -> Snapshot {
		Snapshot {
			node_id: self.node_id,
			version: self.version.load(Ordering::Acquire),
			hash: self.hash.load(Ordering::Acquire),
			has_config: self.has_config.load(Ordering::Acquire),
			last_reload_error: self.last_reload_error.lock().expect("control lock poisoned").clone(),
		}
	}

	pub fn connect_message(&self, hostname: impl Into<String>) -> ClientMessage {
		ClientMessage::Connect {
			node_id: self.node_id,
			version: self.version.load(Ordering::Acquire),
			hostname: hostname.into(),
			config_hash: self.hash.load(Ordering::Acquire),
		}
	}

	/// `timestamp_unix` is taken as a parameter rather than read from the
	/// wall clock internally, so this type carries no hidden
	/// time-of-day dependency of its own.
	pub fn heartbeat_message(&self, status: impl Into<String>, timestamp_unix: u64) -> ClientMessage {
		ClientMessage::Heartbeat {
			node_id: self.node_id,
			config_version: self.version.load(Ordering::Acquire),
			config_hash: self.hash.load(Ordering::Acquire),
			status: status.into(),
			timestamp_unix,
		}
	}

	/// Verifies, reloads, and (on success) persists a received
	/// `ConfigUpdate` (§4.15). A hash mismatch or a failed reload leaves
	/// `{version, hash, has_config, cached file}` untouched and only updates
	/// `last_reload_error` — per DP-1, "failures never corrupt the cached
	/// copy".
	pub async fn apply_update(&self, update: ConfigUpdate, reload: &dyn ReloadSink) -> Result<(), GatewayError> {
		let computed = xxh64(update.yaml.as_bytes());
		if computed != update.hash {
			let detail = format!("config update hash mismatch: expected {:#x}, computed {:#x}", update.hash, computed);
			*self.last_reload_error.lock().expect("control lock poisoned") = Some(detail.clone());
			return Err(GatewayError::Configuration(detail));
		}

		if let Err(e) = reload.reload(&update.yaml).await {
			*self.last_reload_error.lock().expect("control lock poisoned") = Some(e.to_string());
			return Err(e);
		}

		if let Err(e) = atomic_write(&self.config_path(), update.yaml.as_bytes()).await {
			// The reload already succeeded in memory; a disk-write failure
			// is logged as a degradation rather than unwound, since the
			// running config is already correct and only the persisted
			// copy is stale.
			*self.last_reload_error.lock().expect("control lock poisoned") =
				Some(format!("reload applied but cache write failed: {e}"));
			tracing::warn!(error = %e, "control: failed to persist config cache");
		} else {
			*self.last_reload_error.lock().expect("control lock poisoned") = None;
		}

		self.version.store(update.version, Ordering::Release);
		self.hash.store(update.hash, Ordering::Release);
		self.has_config.store(true, Ordering::Release);
		Ok(())
	}
}

/// Truncated exponential backoff for stream reconnects (§5 "reconnect
/// with exponential backoff on disconnect"), doubling from `base` up to
/// `max`.
pub struct Backoff {
	base: Duration,
	max: Duration,
	attempt: u32,
}

impl Backoff {
	pub fn new(base: Duration, max: Duration) -> Self {
		Backoff { base, max, attempt: 0 }
	}

	pub fn next_delay(&mut self) -> Duration {
		let factor = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
		self.attempt = self.attempt.saturating_add(1);
		self.base.saturating_mul(factor as u32).min(self.max)
	}

	pub fn reset(&mut self) {
		self.attempt = 0;
	}
}

/// Drives one stream's worth of `ConfigUpdate`s into `loader` until the
/// stream closes or errors, returning control to the caller so it can
/// reconnect with [`Backoff`] (§4.15's full connect/heartbeat/reconnect
/// loop, including the transport dial itself, is the sketched part this
/// crate leaves to the deployment's `ControlStream` implementation).
pub async fn drive_stream(
	loader: &CachedConfigLoader,
	stream: &mut dyn ControlStream,
	reload: &dyn ReloadSink,
	hostname: &str,
) -> Result<(), GatewayError> {
	stream.send(loader.connect_message(hostname.to_string())).await?;
	loop {
		match stream.recv().await? {
			Some(update) => {
				// A rejected update (bad hash or failed reload) fails this
				// one update open: the stream stays up and the gateway
				// keeps serving its last-known-good config (§4.15 "fails
				// open: serves cached config indefinitely").
				if let Err(e) = loader.apply_update(update, reload).await {
					tracing::warn!(error = %e, "control: rejected config update");
				}
			},
			None => return Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct RecordingSink {
		calls: std::sync::atomic::AtomicU64,
		fail: bool,
	}

	#[async_trait]
	impl ReloadSink for RecordingSink {
		async fn reload(&self, _yaml: &str) -> Result<(), GatewayError> {
			self.calls.fetch_add(1, Ordering::Relaxed);
			if self.fail {
				Err(GatewayError::Configuration("bad config".into()))
			} else {
				Ok(())
			}
		}
	}

	#[tokio::test]
	async fn dp1_bad_hash_leaves_version_hash_and_file_untouched() {
		let dir = tempfile::tempdir().unwrap();
		let loader = CachedConfigLoader::open(dir.path()).await.unwrap();
		let sink = RecordingSink {
			calls: AtomicU64::new(0),
			fail: false,
		};
		let update = ConfigUpdate {
			version: 5,
			yaml: "routes: []".to_string(),
			hash: 0xBAD,
			source: "test".to_string(),
		};
		let err = loader.apply_update(update, &sink).await.unwrap_err();
		assert!(matches!(err, GatewayError::Configuration(_)));
		assert_eq!(sink.calls.load(Ordering::Relaxed), 0, "reload must not be invoked on a hash mismatch");
		let snap = loader.snapshot();
		assert_eq!(snap.version, 0);
		assert_eq!(snap.hash, 0);
		assert!(!snap.has_config);
		assert!(!dir.path().join(CONFIG_FILE).exists());
	}

	#[tokio::test]
	async fn good_update_persists_and_advances_version() {
		let dir = tempfile::tempdir().unwrap();
		let loader = CachedConfigLoader::open(dir.path()).await.unwrap();
		let sink = RecordingSink {
			calls: AtomicU64::new(0),
			fail: false,
		};
		let yaml = "routes: []".to_string();
		let hash = xxh64(yaml.as_bytes());
		let update = ConfigUpdate {
			version: 7,
			yaml: yaml.clone(),
			hash,
			source: "test".to_string(),
		};
		loader.apply_update(update, &sink).await.unwrap();
		assert_eq!(sink.calls.load(Ordering::Relaxed), 1);
		let snap = loader.snapshot();
		assert_eq!(snap.version, 7);
		assert_eq!(snap.hash, hash);
		assert!(snap.has_config);
		let on_disk = tokio::fs::read_to_string(dir.path().join(CONFIG_FILE)).await.unwrap();
		assert_eq!(on_disk, yaml);
	}

	#[tokio::test]
	async fn failed_reload_does_not_advance_version_or_write_file() {
		let dir = tempfile::tempdir().unwrap();
		let loader = CachedConfigLoader::open(dir.path()).await.unwrap();
		let sink = RecordingSink {
			calls: AtomicU64::new(0),
			fail: true,
		};
		let yaml = "routes: [bad]".to_string();
		let hash = xxh64(yaml.as_bytes());
		let update = ConfigUpdate {
			version: 3,
			yaml,
			hash,
			source: "test".to_string(),
		};
		assert!(loader.apply_update(update, &sink).await.is_err());
		let snap = loader.snapshot();
		assert_eq!(snap.version, 0);
		assert!(!snap.has_config);
		assert!(!dir.path().join(CONFIG_FILE).exists());
	}

	#[tokio::test]
	async fn bootstrap_reads_last_known_good_without_advancing_version() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join(CONFIG_FILE), b"routes: []").await.unwrap();
		let loader = CachedConfigLoader::open(dir.path()).await.unwrap();
		let sink = RecordingSink {
			calls: AtomicU64::new(0),
			fail: false,
		};
		let found = loader.bootstrap(&sink).await.unwrap();
		assert!(found);
		assert_eq!(sink.calls.load(Ordering::Relaxed), 1);
		// Disk bootstrap has no version/hash metadata of its own to adopt.
		assert_eq!(loader.snapshot().version, 0);
	}

	#[test]
	fn backoff_doubles_up_to_max() {
		let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
		assert_eq!(b.next_delay(), Duration::from_millis(100));
		assert_eq!(b.next_delay(), Duration::from_millis(200));
		assert_eq!(b.next_delay(), Duration::from_millis(400));
		assert_eq!(b.next_delay(), Duration::from_millis(800));
		assert_eq!(b.next_delay(), Duration::from_millis(1600));
		assert_eq!(b.next_delay(), Duration::from_secs(2)); // clamped
	}

	#[tokio::test]
	async fn node_id_persists_across_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let first = CachedConfigLoader::open(dir.path()).await.unwrap();
		let second = CachedConfigLoader::open(dir.path()).await.unwrap();
		assert_eq!(first.snapshot().node_id, second.snapshot().node_id);
	}
}
