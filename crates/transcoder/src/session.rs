//! Transcode session registry.
//!
//! The registry is the only component that starts or kills transcoder processes. It
//! keeps one record per [`SessionKey`], enforces the global concurrency ceiling by
//! evicting the least recently used sessions, and reclaims idle, dead and orphaned
//! work from a periodic sweep it owns.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{AdaptiveBufferMonitor, BufferStatusReport};
use crate::cache::{summarize, walk_files};
use crate::process::{self, TermSignal, TranscoderProcess};
use crate::progress::ProgressParser;
use crate::{TranscodeError, TranscoderConfig, hls};

const STDERR_EXCERPT_BYTES: usize = 800;

/// Identity of a transcode session: one live process at most per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub source: PathBuf,
    pub audio_track: u32,
    /// Seconds; set only for seek-qualified sessions.
    pub seek_offset: Option<u32>,
}

impl SessionKey {
    pub fn new(source: impl Into<PathBuf>, audio_track: u32, seek_offset: Option<u32>) -> Self {
        Self {
            source: source.into(),
            audio_track,
            seek_offset,
        }
    }

    /// Stable short id; names the session's output directory.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(self.audio_track.to_le_bytes());
        hasher.update([0]);
        match self.seek_offset {
            Some(offset) => hasher.update(offset.to_le_bytes()),
            None => hasher.update(b"-"),
        }
        hex::encode(hasher.finalize())[..24].to_string()
    }

    pub fn without_seek(&self) -> Self {
        Self {
            seek_offset: None,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#a{}", self.source.display(), self.audio_track)?;
        if let Some(offset) = self.seek_offset {
            write!(f, "@{offset}s")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running { pid: u32 },
    /// Transcoder finished the whole source; segments stay servable.
    Completed,
    Exited { code: Option<i32> },
}

/// Published by the supervisor once the transcoder exits.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
    pub stderr_excerpt: String,
}

pub type ExitWatch = watch::Receiver<Option<ExitInfo>>;

/// Handed out by [`SessionRegistry::register`]; identifies one incarnation of a key.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub key: SessionKey,
    pub id: String,
    pub instance: Uuid,
    pub output_dir: PathBuf,
}

#[derive(Debug)]
pub struct SpawnedSession {
    pub pid: u32,
    pub exit: ExitWatch,
}

/// Contents of `session.json` inside every output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub id: String,
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
}

struct SessionEntry {
    key: SessionKey,
    id: String,
    instance: Uuid,
    output_dir: PathBuf,
    state: SessionState,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    last_access: Instant,
    timeout: Option<JoinHandle<()>>,
    monitor: Arc<Mutex<AdaptiveBufferMonitor>>,
    exit: Option<ExitWatch>,
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            key: self.key.clone(),
            state: self.state,
            created_at: self.created_wall,
            age_secs: self.created_at.elapsed().as_secs(),
            idle_secs: self.last_access.elapsed().as_secs(),
            output_dir: self.output_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub key: SessionKey,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub max_concurrent: usize,
    pub oldest_age_secs: Option<u64>,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub stats: RegistryStats,
    /// Transcoder processes running against the working root that nothing tracks.
    pub zombie_count: usize,
    pub zombies: Vec<TranscoderProcess>,
    /// Tracked sessions whose process no longer exists.
    pub dead_tracked: Vec<String>,
    pub disk_usage_bytes: u64,
    pub disk_files: u64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Torn down by `cleanup_all`, whatever their state.
    pub sessions_killed: usize,
    pub idle_killed: usize,
    pub dead_reaped: usize,
    pub strays_killed: usize,
    pub stale_dirs_removed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.sessions_killed
            + self.idle_killed
            + self.dead_reaped
            + self.strays_killed
            + self.stale_dirs_removed
    }
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct RegistryInner {
    config: TranscoderConfig,
    sessions: Mutex<HashMap<SessionKey, SessionEntry>>,
    /// Serializes register/kill for one key across await points.
    key_locks: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.cancel.cancel();
        }
    }
}

/// Manages all transcode sessions. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(config: TranscoderConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                sessions: Mutex::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    fn from_weak(weak: &Weak<RegistryInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.inner.config
    }

    pub fn root(&self) -> &Path {
        &self.inner.config.transcode_dir
    }

    pub fn output_dir_for(&self, key: &SessionKey) -> PathBuf {
        self.root().join(key.id())
    }

    fn key_lock(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .key_locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    pub fn has_active(&self, key: &SessionKey) -> bool {
        self.inner.sessions.lock().contains_key(key)
    }

    /// Refresh last access. Returns false if the key has no session.
    pub fn touch(&self, key: &SessionKey) -> bool {
        match self.inner.sessions.lock().get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn is_current(&self, key: &SessionKey, instance: Uuid) -> bool {
        self.inner
            .sessions
            .lock()
            .get(key)
            .is_some_and(|e| e.instance == instance)
    }

    pub fn current_instance(&self, key: &SessionKey) -> Option<Uuid> {
        self.inner.sessions.lock().get(key).map(|e| e.instance)
    }

    pub fn state(&self, key: &SessionKey) -> Option<SessionState> {
        self.inner.sessions.lock().get(key).map(|e| e.state)
    }

    pub fn output_dir(&self, key: &SessionKey) -> Option<PathBuf> {
        self.inner
            .sessions
            .lock()
            .get(key)
            .map(|e| e.output_dir.clone())
    }

    pub fn age(&self, key: &SessionKey) -> Option<Duration> {
        self.inner
            .sessions
            .lock()
            .get(key)
            .map(|e| e.created_at.elapsed())
    }

    pub fn exit_watch(&self, key: &SessionKey) -> Option<ExitWatch> {
        self.inner
            .sessions
            .lock()
            .get(key)
            .and_then(|e| e.exit.clone())
    }

    pub fn record_consumed(&self, key: &SessionKey, index: u32) {
        let monitor = self
            .inner
            .sessions
            .lock()
            .get(key)
            .map(|e| e.monitor.clone());
        if let Some(monitor) = monitor {
            monitor.lock().record_consumed(index);
        }
    }

    pub fn buffer_report(&self, key: &SessionKey) -> Option<BufferStatusReport> {
        let monitor = self
            .inner
            .sessions
            .lock()
            .get(key)
            .map(|e| e.monitor.clone())?;
        let report = monitor.lock().status_report();
        Some(report)
    }

    /// Create a Pending session for `key`, replacing (and terminating) any existing
    /// one. The output directory exists when this returns.
    pub async fn register(&self, key: SessionKey) -> Result<SessionTicket, TranscodeError> {
        let lock = self.key_lock(&key);
        let ticket = {
            let _guard = lock.lock().await;

            let id = key.id();
            let output_dir = self.output_dir_for(&key);
            let instance = Uuid::new_v4();
            let now = Instant::now();
            let entry = SessionEntry {
                key: key.clone(),
                id: id.clone(),
                instance,
                output_dir: output_dir.clone(),
                state: SessionState::Pending,
                created_at: now,
                created_wall: Utc::now(),
                last_access: now,
                timeout: Some(self.arm_timeout(key.clone(), instance)),
                monitor: Arc::new(Mutex::new(AdaptiveBufferMonitor::new(
                    self.inner.config.segment_secs,
                ))),
                exit: None,
            };

            // Check-then-register is a single critical section.
            let replaced = self.inner.sessions.lock().insert(key.clone(), entry);
            if let Some(old) = replaced {
                info!(session = %old.id, key = %key, "replacing existing session");
                self.terminate(old, "replaced").await;
            }

            if let Err(e) = self.prepare_dir(&key, &id, &output_dir).await {
                if let Some(entry) = self.remove_instance(&key, instance) {
                    self.terminate(entry, "output directory unavailable").await;
                }
                return Err(e);
            }

            info!(session = %id, key = %key, "transcode session registered");
            SessionTicket {
                key,
                id,
                instance,
                output_dir,
            }
        };

        self.enforce_concurrency_limit().await;
        Ok(ticket)
    }

    async fn prepare_dir(
        &self,
        key: &SessionKey,
        id: &str,
        output_dir: &Path,
    ) -> Result<(), TranscodeError> {
        tokio::fs::create_dir_all(output_dir).await?;
        let descriptor = SessionDescriptor {
            id: id.to_string(),
            key: key.clone(),
            created_at: Utc::now(),
        };
        match serde_json::to_vec_pretty(&descriptor) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(output_dir.join(hls::DESCRIPTOR_NAME), json).await
                {
                    warn!(session = %id, error = %e, "failed to write session descriptor");
                }
            }
            Err(e) => warn!(session = %id, error = %e, "failed to encode session descriptor"),
        }
        Ok(())
    }

    fn arm_timeout(&self, key: SessionKey, instance: Uuid) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let limit = self.inner.config.absolute_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if let Some(registry) = SessionRegistry::from_weak(&weak) {
                // Separate task: terminate() aborts this timer's handle.
                tokio::spawn(async move {
                    registry
                        .kill_instance(&key, instance, "absolute timeout")
                        .await;
                });
            }
        })
    }

    /// Start the transcoder for a registered session. This is the only place a
    /// transcoder process is created. On failure the registration is rolled back.
    pub async fn spawn(
        &self,
        ticket: &SessionTicket,
        program: &Path,
        args: &[String],
    ) -> Result<SpawnedSession, TranscodeError> {
        if !self.is_current(&ticket.key, ticket.instance) {
            return Err(TranscodeError::SessionNotFound(ticket.key.to_string()));
        }

        let log_file = match std::fs::File::create(ticket.output_dir.join(hls::LOG_NAME)) {
            Ok(f) => f,
            Err(e) => {
                self.kill_instance(&ticket.key, ticket.instance, "spawn failed")
                    .await;
                return Err(TranscodeError::SpawnFailed(format!("create log: {e}")));
            }
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::from(log_file))
            .kill_on_drop(true);
        process::isolate_process_group(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.kill_instance(&ticket.key, ticket.instance, "spawn failed")
                    .await;
                return Err(TranscodeError::SpawnFailed(format!(
                    "{}: {e}",
                    program.display()
                )));
            }
        };

        let Some(pid) = child.id() else {
            self.kill_instance(&ticket.key, ticket.instance, "spawn failed")
                .await;
            return Err(TranscodeError::SpawnFailed("process exited immediately".into()));
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get_mut(&ticket.key) {
                Some(entry) if entry.instance == ticket.instance => {
                    entry.state = SessionState::Running { pid };
                    entry.exit = Some(exit_rx.clone());
                    Some(entry.monitor.clone())
                }
                _ => None,
            }
        };

        let Some(monitor) = monitor else {
            // Evicted or replaced while the process was starting.
            let _ = process::signal_group(pid, TermSignal::Forced);
            let _ = child.wait().await;
            return Err(TranscodeError::SessionNotFound(ticket.key.to_string()));
        };

        let stdout = child.stdout.take();
        tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            ticket.clone(),
            child,
            stdout,
            monitor,
            exit_tx,
        ));

        info!(session = %ticket.id, pid, program = %program.display(), ?args, "transcoder spawned");
        Ok(SpawnedSession { pid, exit: exit_rx })
    }

    /// Pending → Running. Returns false if the key is unknown or not pending.
    pub fn attach_pid(&self, key: &SessionKey, pid: u32) -> bool {
        let mut sessions = self.inner.sessions.lock();
        match sessions.get_mut(key) {
            Some(entry) if entry.state == SessionState::Pending => {
                entry.state = SessionState::Running { pid };
                debug!(session = %entry.id, pid, "pid attached");
                true
            }
            _ => false,
        }
    }

    /// Terminate the session for `key`, if any. Idempotent.
    pub async fn kill(&self, key: &SessionKey) -> bool {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let entry = self.inner.sessions.lock().remove(key);
        match entry {
            Some(entry) => {
                self.terminate(entry, "killed").await;
                true
            }
            None => {
                debug!(key = %key, "kill requested for unknown session");
                false
            }
        }
    }

    /// Kill by the session id shown in stats.
    pub async fn kill_by_id(&self, id: &str) -> bool {
        let key = self
            .inner
            .sessions
            .lock()
            .values()
            .find(|e| e.id == id)
            .map(|e| e.key.clone());
        match key {
            Some(key) => self.kill(&key).await,
            None => false,
        }
    }

    /// Kill only if `instance` is still the live incarnation of `key`.
    pub(crate) async fn kill_instance(
        &self,
        key: &SessionKey,
        instance: Uuid,
        reason: &str,
    ) -> bool {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        match self.remove_instance(key, instance) {
            Some(entry) => {
                self.terminate(entry, reason).await;
                true
            }
            None => false,
        }
    }

    fn remove_instance(&self, key: &SessionKey, instance: Uuid) -> Option<SessionEntry> {
        let mut sessions = self.inner.sessions.lock();
        if sessions.get(key).is_some_and(|e| e.instance == instance) {
            sessions.remove(key)
        } else {
            None
        }
    }

    /// Stop the process (if any) and remove the output directory.
    async fn terminate(&self, mut entry: SessionEntry, reason: &str) {
        if let Some(timeout) = entry.timeout.take() {
            timeout.abort();
        }

        if let SessionState::Running { pid } = entry.state {
            self.stop_process(pid, entry.exit.take()).await;
        }

        match tokio::fs::remove_dir_all(&entry.output_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(session = %entry.id, error = %e, "failed to clean up transcode dir")
            }
        }
        info!(session = %entry.id, key = %entry.key, reason, "session destroyed");
    }

    /// SIGTERM the group, escalate to SIGKILL after the grace window.
    async fn stop_process(&self, pid: u32, mut exit: Option<ExitWatch>) {
        match process::signal_group(pid, TermSignal::Graceful) {
            Ok(true) => {}
            Ok(false) => {
                debug!(pid, "transcoder already gone");
                return;
            }
            Err(e) => warn!(pid, error = %e, "failed to signal transcoder"),
        }

        if wait_for_exit(pid, exit.as_mut(), self.inner.config.kill_grace).await {
            return;
        }

        warn!(pid, "transcoder ignored SIGTERM, sending SIGKILL");
        match process::signal_group(pid, TermSignal::Forced) {
            Ok(_) => {}
            Err(e) => warn!(pid, error = %e, "failed to force-kill transcoder"),
        }
        wait_for_exit(pid, exit.as_mut(), Duration::from_secs(1)).await;
    }

    /// Evict least-recently-touched sessions until the ceiling holds. The most
    /// recently registered session is never a victim.
    pub async fn enforce_concurrency_limit(&self) -> Vec<SessionKey> {
        let max = self.inner.config.max_concurrent.max(1);
        let victims: Vec<(SessionKey, Uuid)> = {
            let sessions = self.inner.sessions.lock();
            if sessions.len() <= max {
                return Vec::new();
            }
            let newest = sessions
                .values()
                .max_by_key(|e| e.created_at)
                .map(|e| e.instance);
            let mut candidates: Vec<&SessionEntry> = sessions
                .values()
                .filter(|e| Some(e.instance) != newest)
                .collect();
            candidates.sort_by_key(|e| (e.last_access, e.created_at));
            candidates
                .into_iter()
                .take(sessions.len() - max)
                .map(|e| (e.key.clone(), e.instance))
                .collect()
        };

        let mut evicted = Vec::with_capacity(victims.len());
        for (key, instance) in victims {
            warn!(key = %key, max, "concurrency limit reached, evicting least recently used session");
            if self.kill_instance(&key, instance, "concurrency limit").await {
                evicted.push(key);
            }
        }
        evicted
    }

    /// Periodic reclamation of idle sessions, dead processes, untracked transcoders
    /// and untracked directories.
    pub async fn cleanup_orphans(&self) -> SweepReport {
        let config = &self.inner.config;
        let mut report = SweepReport::default();

        let (idle, dead) = {
            let sessions = self.inner.sessions.lock();
            let idle: Vec<(SessionKey, Uuid)> = sessions
                .values()
                .filter(|e| e.last_access.elapsed() > config.idle_timeout)
                .map(|e| (e.key.clone(), e.instance))
                .collect();
            let dead: Vec<(SessionKey, Uuid)> = sessions
                .values()
                .filter(|e| match e.state {
                    SessionState::Running { pid } => !process::is_alive(pid),
                    _ => false,
                })
                .filter(|e| e.last_access.elapsed() <= config.idle_timeout)
                .map(|e| (e.key.clone(), e.instance))
                .collect();
            (idle, dead)
        };

        for (key, instance) in idle {
            if self.kill_instance(&key, instance, "idle timeout").await {
                report.idle_killed += 1;
            }
        }
        for (key, instance) in dead {
            if self.kill_instance(&key, instance, "process vanished").await {
                report.dead_reaped += 1;
            }
        }

        for stray in self.untracked_transcoders().await {
            if stray.age() < config.orphan_grace {
                debug!(pid = stray.pid, "untracked transcoder still within grace period");
                continue;
            }
            warn!(pid = stray.pid, command = %stray.command, "killing untracked transcoder");
            if kill_stray(stray.pid) {
                report.strays_killed += 1;
            }
        }

        report.stale_dirs_removed = self.remove_stale_dirs(config.orphan_grace).await;

        self.inner.key_locks.lock().retain(|key, lock| {
            Arc::strong_count(lock) > 1 || self.inner.sessions.lock().contains_key(key)
        });

        if report.total() > 0 {
            info!(?report, "orphan sweep reclaimed resources");
        } else {
            debug!("orphan sweep found nothing to reclaim");
        }
        report
    }

    /// Kill everything, including untracked transcoders, and wipe the working root.
    pub async fn cleanup_all(&self) -> SweepReport {
        let entries: Vec<SessionEntry> = self
            .inner
            .sessions
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        let mut report = SweepReport {
            sessions_killed: entries.len(),
            ..SweepReport::default()
        };
        futures::future::join_all(
            entries
                .into_iter()
                .map(|entry| self.terminate(entry, "global cleanup")),
        )
        .await;

        for stray in self.untracked_transcoders().await {
            if kill_stray(stray.pid) {
                report.strays_killed += 1;
            }
        }

        let root = self.root();
        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(root = %root.display(), error = %e, "failed to wipe working root"),
        }
        if let Err(e) = tokio::fs::create_dir_all(root).await {
            warn!(root = %root.display(), error = %e, "failed to recreate working root");
        }

        info!(?report, "all transcode sessions torn down");
        report
    }

    /// Remove every output directory belonging to `source`, tracked or not.
    pub async fn remove_source_dirs(&self, source: &Path) -> usize {
        let keys: Vec<SessionKey> = self
            .inner
            .sessions
            .lock()
            .keys()
            .filter(|k| k.source == source)
            .cloned()
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.kill(&key).await {
                removed += 1;
            }
        }

        for (dir, descriptor) in self.read_descriptors().await {
            if descriptor.key.source != source {
                continue;
            }
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove session dir"),
            }
        }
        removed
    }

    async fn read_descriptors(&self) -> Vec<(PathBuf, SessionDescriptor)> {
        let mut found = Vec::new();
        let Ok(mut dirs) = tokio::fs::read_dir(self.root()).await else {
            return found;
        };
        while let Ok(Some(entry)) = dirs.next_entry().await {
            let dir = entry.path();
            let Ok(raw) = tokio::fs::read(dir.join(hls::DESCRIPTOR_NAME)).await else {
                continue;
            };
            if let Ok(descriptor) = serde_json::from_slice::<SessionDescriptor>(&raw) {
                found.push((dir, descriptor));
            }
        }
        found
    }

    async fn remove_stale_dirs(&self, grace: Duration) -> usize {
        let tracked: HashSet<String> = self
            .inner
            .sessions
            .lock()
            .values()
            .map(|e| e.id.clone())
            .collect();

        let Ok(mut dirs) = tokio::fs::read_dir(self.root()).await else {
            return 0;
        };
        let mut removed = 0;
        while let Ok(Some(entry)) = dirs.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if tracked.contains(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let young = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age < grace);
            if !meta.is_dir() || young {
                continue;
            }
            // Re-check: a registration may have claimed the name meanwhile.
            if self
                .inner
                .sessions
                .lock()
                .values()
                .any(|e| e.id == name)
            {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    debug!(dir = %name, "removed untracked session directory");
                    removed += 1;
                }
                Err(e) => warn!(dir = %name, error = %e, "failed to remove stale directory"),
            }
        }
        removed
    }

    async fn untracked_transcoders(&self) -> Vec<TranscoderProcess> {
        let tracked: HashSet<u32> = self
            .inner
            .sessions
            .lock()
            .values()
            .filter_map(|e| match e.state {
                SessionState::Running { pid } => Some(pid),
                _ => None,
            })
            .collect();
        let binary = self.inner.config.ffmpeg_path.clone();
        let root = self.root().to_path_buf();
        let found = tokio::task::spawn_blocking(move || process::find_transcoders(&binary, &root))
            .await
            .unwrap_or_default();
        found
            .into_iter()
            .filter(|p| !tracked.contains(&p.pid))
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions = self.inner.sessions.lock();
        let mut stats = RegistryStats {
            active: sessions.len(),
            pending: 0,
            running: 0,
            completed: 0,
            max_concurrent: self.inner.config.max_concurrent,
            oldest_age_secs: None,
            sessions: Vec::with_capacity(sessions.len()),
        };
        for entry in sessions.values() {
            match entry.state {
                SessionState::Pending => stats.pending += 1,
                SessionState::Running { .. } => stats.running += 1,
                SessionState::Completed => stats.completed += 1,
                SessionState::Exited { .. } => {}
            }
            let info = entry.info();
            stats.oldest_age_secs = Some(stats.oldest_age_secs.unwrap_or(0).max(info.age_secs));
            stats.sessions.push(info);
        }
        stats.sessions.sort_by_key(|s| std::cmp::Reverse(s.age_secs));
        stats
    }

    /// Compare tracked state with what the OS and filesystem report.
    pub async fn health_check(&self) -> HealthReport {
        let stats = self.stats();
        let dead_tracked: Vec<String> = {
            let sessions = self.inner.sessions.lock();
            sessions
                .values()
                .filter(|e| match e.state {
                    SessionState::Running { pid } => !process::is_alive(pid),
                    _ => false,
                })
                .map(|e| e.id.clone())
                .collect()
        };
        let zombies = self.untracked_transcoders().await;

        let root = self.root().to_path_buf();
        let usage = tokio::task::spawn_blocking(move || summarize(&walk_files(&root, &|_| true)))
            .await
            .unwrap_or_default();

        let healthy =
            zombies.is_empty() && dead_tracked.is_empty() && stats.active <= stats.max_concurrent;
        HealthReport {
            stats,
            zombie_count: zombies.len(),
            zombies,
            dead_tracked,
            disk_usage_bytes: usage.total_size,
            disk_files: usage.total_files,
            healthy,
        }
    }

    /// Start the periodic orphan sweep. A previously started sweep is stopped first.
    pub fn start_sweeper(&self, every: Duration) {
        self.stop_sweeper();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = SessionRegistry::from_weak(&weak) else {
                            break;
                        };
                        registry.cleanup_orphans().await;
                    }
                }
            }
            debug!("orphan sweeper stopped");
        });

        *self.inner.sweeper.lock() = Some(Sweeper { cancel, handle });
        info!(interval_secs = every.as_secs(), "orphan sweeper started");
    }

    pub fn stop_sweeper(&self) {
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.cancel.cancel();
            sweeper.handle.abort();
        }
    }

    pub fn sweeper_running(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    async fn mark_completed(&self, ticket: &SessionTicket) {
        let current = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get_mut(&ticket.key) {
                Some(entry) if entry.instance == ticket.instance => {
                    entry.state = SessionState::Completed;
                    entry.exit = None;
                    true
                }
                _ => false,
            }
        };
        if current {
            let marker = ticket.output_dir.join(hls::COMPLETE_MARKER);
            if let Err(e) = tokio::fs::write(&marker, b"").await {
                warn!(session = %ticket.id, error = %e, "failed to write completion marker");
            }
            info!(session = %ticket.id, "transcode complete");
        }
    }

    fn mark_exited(&self, ticket: &SessionTicket, code: Option<i32>) -> bool {
        let mut sessions = self.inner.sessions.lock();
        match sessions.get_mut(&ticket.key) {
            Some(entry) if entry.instance == ticket.instance => {
                entry.state = SessionState::Exited { code };
                true
            }
            _ => false,
        }
    }
}

/// Owns the child: forwards progress into the buffer monitor, then reports the exit.
async fn supervise(
    registry: Weak<RegistryInner>,
    ticket: SessionTicket,
    mut child: Child,
    stdout: Option<ChildStdout>,
    monitor: Arc<Mutex<AdaptiveBufferMonitor>>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    if let Some(stdout) = stdout {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = ProgressParser::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(progress) = parser.push_line(&line) {
                    monitor.lock().record_progress(&progress);
                }
            }
        });
    }

    let (code, success) = match child.wait().await {
        Ok(status) => (status.code(), status.success()),
        Err(e) => {
            warn!(session = %ticket.id, error = %e, "failed to wait on transcoder");
            (None, false)
        }
    };

    let registry = SessionRegistry::from_weak(&registry);

    if success {
        monitor.lock().mark_finished();
        if let Some(registry) = &registry {
            registry.mark_completed(&ticket).await;
        }
        let _ = exit_tx.send(Some(ExitInfo {
            code,
            success,
            stderr_excerpt: String::new(),
        }));
        return;
    }

    // The pid is reaped; leave Running before the first await so nothing signals it.
    let was_current = registry
        .as_ref()
        .is_some_and(|r| r.mark_exited(&ticket, code));
    let stderr_excerpt = read_log_tail(&ticket.output_dir.join(hls::LOG_NAME)).await;
    let _ = exit_tx.send(Some(ExitInfo {
        code,
        success,
        stderr_excerpt: stderr_excerpt.clone(),
    }));

    if was_current {
        warn!(session = %ticket.id, ?code, stderr = %stderr_excerpt, "transcoder exited abnormally");
        if let Some(registry) = registry {
            registry
                .kill_instance(&ticket.key, ticket.instance, "process exited")
                .await;
        }
    } else {
        debug!(session = %ticket.id, ?code, "terminated transcoder exited");
    }
}

async fn wait_for_exit(pid: u32, exit: Option<&mut ExitWatch>, timeout: Duration) -> bool {
    match exit {
        // A closed channel means the supervisor is gone, so the child was reaped.
        Some(rx) => tokio::time::timeout(timeout, rx.wait_for(|v| v.is_some()))
            .await
            .is_ok(),
        None => {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if !process::is_alive(pid) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            !process::is_alive(pid)
        }
    }
}

fn kill_stray(pid: u32) -> bool {
    match process::signal_group(pid, TermSignal::Forced) {
        Ok(true) => true,
        Ok(false) => process::signal_pid(pid, TermSignal::Forced).unwrap_or(false),
        Err(e) => {
            warn!(pid, error = %e, "failed to kill stray transcoder");
            false
        }
    }
}

/// Last few lines of the transcoder's diagnostic log.
async fn read_log_tail(path: &Path) -> String {
    let Ok(raw) = tokio::fs::read(path).await else {
        return String::new();
    };
    let start = raw.len().saturating_sub(STDERR_EXCERPT_BYTES);
    let text = String::from_utf8_lossy(&raw[start..]);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(8)..].join("\n")
}
