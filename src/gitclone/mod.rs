//! Bare-mirror clone manager.
//!
//! The manager owns `mirror_root/` and every [`Repository`] inside it.
//! Mirrors live at `mirror_root/<host>/<repo-path-without-.git>` as bare
//! clones (`HEAD` directly in the directory).  Repositories move through
//! `empty -> cloning -> ready`, rolling back to `empty` when a clone fails so
//! the next request retries.

pub mod command;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::serde_duration;
use crate::githubapp::TokenProvider;
use command::{git_succeeds, run_git};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitCloneConfig {
    /// Directory holding the bare mirrors.
    pub mirror_root: PathBuf,
    /// How often a served repository is re-fetched in the background.
    #[serde(default = "default_fetch_interval", with = "serde_duration")]
    pub fetch_interval: Duration,
    /// How long a successful ref-freshness check stays valid.
    #[serde(default = "default_ref_check_interval", with = "serde_duration")]
    pub ref_check_interval: Duration,
}

fn default_fetch_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_ref_check_interval() -> Duration {
    Duration::from_secs(10)
}

/// Git transport tuning applied to every clone/fetch against an upstream.
#[derive(Debug, Clone)]
pub struct GitTuning {
    /// `http.postBuffer` in bytes.
    pub post_buffer: u64,
    /// `http.lowSpeedLimit` in bytes/second.
    pub low_speed_limit: u32,
    /// `http.lowSpeedTime`.
    pub low_speed_time: Duration,
}

impl Default for GitTuning {
    fn default() -> Self {
        Self {
            post_buffer: 524_288_000,
            low_speed_limit: 1000,
            low_speed_time: Duration::from_secs(600),
        }
    }
}

impl GitTuning {
    fn args(&self) -> Vec<String> {
        vec![
            "-c".to_string(),
            format!("http.postBuffer={}", self.post_buffer),
            "-c".to_string(),
            format!("http.lowSpeedLimit={}", self.low_speed_limit),
            "-c".to_string(),
            format!("http.lowSpeedTime={}", self.low_speed_time.as_secs()),
        ]
    }
}

/// Config keys applied to every mirror on clone and rediscovery.  Bitmaps,
/// commit graphs and the multi-pack-index keep `upload-pack` fast; unpack
/// limits keep fetched objects in packs; auto-GC is off because maintenance
/// is scheduled explicitly.
const MIRROR_CONFIG: &[(&str, &str)] = &[
    ("protocol.version", "2"),
    ("uploadpack.allowFilter", "true"),
    ("uploadpack.allowReachableSHA1InWant", "true"),
    ("repack.writeBitmaps", "true"),
    ("pack.useBitmaps", "true"),
    ("pack.useBitmapBoundaryTraversal", "true"),
    ("core.commitGraph", "true"),
    ("gc.writeCommitGraph", "true"),
    ("fetch.writeCommitGraph", "true"),
    ("core.multiPackIndex", "true"),
    ("transfer.unpackLimit", "1"),
    ("fetch.unpackLimit", "1"),
    ("gc.auto", "0"),
    ("pack.threads", "0"),
    ("pack.deltaCacheSize", "512m"),
    ("pack.windowMemory", "1g"),
];

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    /// Not cloned yet.
    Empty,
    /// Clone in progress.
    Cloning,
    /// Mirror present and servable.
    Ready,
}

impl std::fmt::Display for RepoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RepoState::Empty => "empty",
            RepoState::Cloning => "cloning",
            RepoState::Ready => "ready",
        })
    }
}

struct RepoMeta {
    state: RepoState,
    last_fetch: Option<Instant>,
    last_ref_check: Option<Instant>,
    ref_check_valid: bool,
}

pub struct Repository {
    config: GitCloneConfig,
    tuning: GitTuning,
    path: PathBuf,
    upstream_url: String,
    meta: Mutex<RepoMeta>,
    /// Guards the on-disk mirror: readers (serving, ref listing, probes)
    /// share it, writers (clone, fetch, repack) take it exclusively.
    repo_lock: Arc<tokio::sync::RwLock<()>>,
    /// At most one fetch runs; overlapping callers wait for it and then
    /// return without doing redundant work.
    fetch_sem: tokio::sync::Semaphore,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl Repository {
    fn new(
        config: GitCloneConfig,
        tuning: GitTuning,
        path: PathBuf,
        upstream_url: String,
        state: RepoState,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Self {
        Self {
            config,
            tuning,
            path,
            upstream_url,
            meta: Mutex::new(RepoMeta {
                state,
                last_fetch: None,
                last_ref_check: None,
                ref_check_valid: false,
            }),
            repo_lock: Arc::new(tokio::sync::RwLock::new(())),
            fetch_sem: tokio::sync::Semaphore::new(1),
            token_provider,
        }
    }

    pub fn state(&self) -> RepoState {
        self.meta.lock().expect("repo meta lock poisoned").state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn upstream_url(&self) -> &str {
        &self.upstream_url
    }

    pub fn last_fetch(&self) -> Option<Instant> {
        self.meta.lock().expect("repo meta lock poisoned").last_fetch
    }

    /// Whether the last fetch is older than `interval` (never-fetched counts
    /// as due).
    pub fn needs_fetch(&self, interval: Duration) -> bool {
        match self.last_fetch() {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    /// Hold the repo read lock; used by callers that stream directly from
    /// the mirror (bundle generation, backend serving).
    pub async fn read_guard(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.repo_lock.read().await
    }

    /// Owned variant for responses that keep streaming from the mirror after
    /// the handler returns.
    pub async fn owned_read_guard(&self) -> tokio::sync::OwnedRwLockReadGuard<()> {
        Arc::clone(&self.repo_lock).read_owned().await
    }

    async fn upstream_token(&self) -> Option<String> {
        match &self.token_provider {
            Some(provider) => provider.token_for_url(&self.upstream_url).await,
            None => None,
        }
    }

    /// Clone the mirror.  Only an `empty` repository starts a clone; any
    /// other state returns immediately.  Failure rolls back to `empty`.
    pub async fn clone_mirror(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut meta = self.meta.lock().expect("repo meta lock poisoned");
            if meta.state != RepoState::Empty {
                return Ok(());
            }
            meta.state = RepoState::Cloning;
        }

        let result = self.execute_clone(cancel).await;

        let mut meta = self.meta.lock().expect("repo meta lock poisoned");
        match &result {
            Ok(()) => {
                meta.state = RepoState::Ready;
                meta.last_fetch = Some(Instant::now());
            }
            Err(_) => meta.state = RepoState::Empty,
        }
        result
    }

    async fn execute_clone(&self, cancel: &CancellationToken) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create mirror parent directory")?;
        }

        let _guard = self.repo_lock.write().await;
        let token = self.upstream_token().await;

        let mut args = vec!["clone".to_string(), "--mirror".to_string()];
        args.extend(self.tuning.args());
        args.push(self.upstream_url.clone());
        args.push(self.path.display().to_string());

        run_git(cancel, Some(&self.upstream_url), token.as_deref(), args)
            .await
            .with_context(|| format!("git clone --mirror {}", self.upstream_url))?;

        self.apply_mirror_config(cancel).await
    }

    /// Apply [`MIRROR_CONFIG`] to the mirror.
    pub async fn apply_mirror_config(&self, cancel: &CancellationToken) -> Result<()> {
        for &(key, value) in MIRROR_CONFIG {
            run_git(
                cancel,
                None,
                None,
                [
                    "-C",
                    &self.path.display().to_string(),
                    "config",
                    key,
                    value,
                ],
            )
            .await
            .with_context(|| format!("configure {key}"))?;
        }
        Ok(())
    }

    /// Fetch from upstream with pruning.  A concurrent fetch in flight means
    /// this call waits for it and returns success without fetching again.
    pub async fn fetch(&self, cancel: &CancellationToken) -> Result<()> {
        let _permit = match self.fetch_sem.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(upstream = %self.upstream_url, "fetch already in progress, waiting");
                tokio::select! {
                    permit = self.fetch_sem.acquire() => drop(permit),
                    () = cancel.cancelled() => anyhow::bail!("cancelled while waiting for fetch"),
                }
                return Ok(());
            }
        };

        let _guard = self.repo_lock.write().await;
        let token = self.upstream_token().await;

        let mut args = vec!["-C".to_string(), self.path.display().to_string()];
        args.extend(self.tuning.args());
        args.extend([
            "fetch".to_string(),
            "--prune".to_string(),
            "--prune-tags".to_string(),
        ]);

        run_git(cancel, Some(&self.upstream_url), token.as_deref(), args)
            .await
            .with_context(|| format!("git fetch {}", self.upstream_url))?;

        self.meta.lock().expect("repo meta lock poisoned").last_fetch = Some(Instant::now());
        Ok(())
    }

    /// Check whether upstream `refs/heads/*` diverge from the local mirror
    /// and fetch when they do.  Successful checks are cached for
    /// `ref_check_interval` to bound `ls-remote` traffic.
    pub async fn ensure_refs_up_to_date(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut meta = self.meta.lock().expect("repo meta lock poisoned");
            let fresh = meta.ref_check_valid
                && meta
                    .last_ref_check
                    .is_some_and(|at| at.elapsed() < self.config.ref_check_interval);
            if fresh {
                return Ok(());
            }
            meta.last_ref_check = Some(Instant::now());
            meta.ref_check_valid = true;
        }

        let local = self.local_refs(cancel).await.context("get local refs")?;
        let upstream = self.upstream_refs(cancel).await.context("get upstream refs")?;

        let mut needs_fetch = false;
        for (reference, upstream_sha) in &upstream {
            // Peeled tag entries and non-branch refs (refs/pull/* on GitHub)
            // are not mirrored.
            if reference.ends_with("^{}") || !reference.starts_with("refs/heads/") {
                continue;
            }
            if local.get(reference) != Some(upstream_sha) {
                debug!(
                    upstream = %self.upstream_url,
                    reference,
                    "upstream ref differs from local mirror"
                );
                needs_fetch = true;
                break;
            }
        }

        if !needs_fetch {
            return Ok(());
        }

        info!(upstream = %self.upstream_url, "upstream has new or updated refs, fetching");
        let result = self.fetch(cancel).await;
        if result.is_err() {
            self.meta.lock().expect("repo meta lock poisoned").ref_check_valid = false;
        }
        result
    }

    /// `ref name -> object id` for the local mirror.
    pub async fn local_refs(&self, cancel: &CancellationToken) -> Result<HashMap<String, String>> {
        let _guard = self.repo_lock.read().await;
        let output = run_git(
            cancel,
            None,
            None,
            [
                "-C",
                &self.path.display().to_string(),
                "for-each-ref",
                "--format=%(objectname) %(refname)",
            ],
        )
        .await
        .context("git for-each-ref")?;
        Ok(parse_git_refs(&String::from_utf8_lossy(&output.stdout)))
    }

    /// `ref name -> object id` as advertised by the upstream.
    pub async fn upstream_refs(&self, cancel: &CancellationToken) -> Result<HashMap<String, String>> {
        let token = self.upstream_token().await;
        let output = run_git(
            cancel,
            Some(&self.upstream_url),
            token.as_deref(),
            ["ls-remote", &self.upstream_url],
        )
        .await
        .context("git ls-remote")?;
        Ok(parse_git_refs(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Full repack with bitmap and multi-pack-index generation.
    pub async fn repack(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.repo_lock.read().await;
        run_git(
            cancel,
            None,
            None,
            [
                "-C",
                &self.path.display().to_string(),
                "repack",
                "-adb",
                "--write-midx",
                "--write-bitmap-index",
            ],
        )
        .await
        .context("git repack")?;
        Ok(())
    }

    /// Whether `reference` resolves to an object in the mirror.
    pub async fn has_commit(&self, cancel: &CancellationToken, reference: &str) -> Result<bool> {
        let _guard = self.repo_lock.read().await;
        git_succeeds(
            cancel,
            [
                "-C",
                &self.path.display().to_string(),
                "cat-file",
                "-e",
                reference,
            ],
        )
        .await
    }
}

/// Parse `git ls-remote` / `git for-each-ref` style output: one
/// `<sha> <ref>` pair per line.
pub fn parse_git_refs(output: &str) -> HashMap<String, String> {
    let mut refs = HashMap::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(sha), Some(reference)) = (fields.next(), fields.next()) {
            refs.insert(reference.to_string(), sha.to_string());
        }
    }
    refs
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct Manager {
    config: GitCloneConfig,
    tuning: GitTuning,
    repos: Mutex<HashMap<String, Arc<Repository>>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl Manager {
    pub fn new(
        config: GitCloneConfig,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self> {
        anyhow::ensure!(
            !config.mirror_root.as_os_str().is_empty(),
            "mirror-root is required"
        );
        std::fs::create_dir_all(&config.mirror_root).context("create mirror root")?;

        info!(
            mirror_root = %config.mirror_root.display(),
            fetch_interval_secs = config.fetch_interval.as_secs(),
            ref_check_interval_secs = config.ref_check_interval.as_secs(),
            "git clone manager initialised"
        );

        Ok(Self {
            config,
            tuning: GitTuning::default(),
            repos: Mutex::new(HashMap::new()),
            token_provider,
        })
    }

    pub fn config(&self) -> &GitCloneConfig {
        &self.config
    }

    /// Deterministic mirror path for an upstream URL:
    /// `mirror_root/<host>/<path-without-.git>`.
    fn clone_path_for_url(&self, upstream_url: &str) -> PathBuf {
        let Ok(parsed) = url::Url::parse(upstream_url) else {
            return self.config.mirror_root.join("unknown");
        };
        let host = parsed.host_str().unwrap_or("unknown");
        let path = parsed.path().trim_start_matches('/');
        let repo_path = path.strip_suffix(".git").unwrap_or(path);
        self.config.mirror_root.join(host).join(repo_path)
    }

    /// Look up or register the repository for `upstream_url`.  The same URL
    /// always yields the same instance; a mirror already on disk (probed via
    /// its `HEAD` file) starts out `ready`.
    pub fn get_or_create(&self, upstream_url: &str) -> Arc<Repository> {
        let mut repos = self.repos.lock().expect("manager lock poisoned");
        if let Some(repo) = repos.get(upstream_url) {
            return Arc::clone(repo);
        }

        let path = self.clone_path_for_url(upstream_url);
        let state = if path.join("HEAD").is_file() {
            RepoState::Ready
        } else {
            RepoState::Empty
        };
        let repo = Arc::new(Repository::new(
            self.config.clone(),
            self.tuning.clone(),
            path,
            upstream_url.to_string(),
            state,
            self.token_provider.clone(),
        ));
        repos.insert(upstream_url.to_string(), Arc::clone(&repo));
        repo
    }

    pub fn get(&self, upstream_url: &str) -> Option<Arc<Repository>> {
        self.repos
            .lock()
            .expect("manager lock poisoned")
            .get(upstream_url)
            .cloned()
    }

    /// Walk the mirror root and register every directory containing a `HEAD`
    /// file as a ready repository, re-applying the mirror config.  Spool and
    /// snapshot scratch directories are skipped.
    pub async fn discover_existing(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<Repository>>> {
        let mut discovered = Vec::new();
        let mut walker = walkdir::WalkDir::new(&self.config.mirror_root)
            .min_depth(1)
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.context("walk mirror root")?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name == ".spools" || name == ".snapshots" {
                walker.skip_current_dir();
                continue;
            }
            if !entry.path().join("HEAD").is_file() {
                continue;
            }
            // A mirror directory; don't descend into its internals.
            walker.skip_current_dir();

            let relative = entry
                .path()
                .strip_prefix(&self.config.mirror_root)
                .context("mirror path outside root")?;
            let mut segments = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().to_string());
            let Some(host) = segments.next() else {
                continue;
            };
            let repo_path: Vec<String> = segments.collect();
            if repo_path.is_empty() {
                continue;
            }
            let upstream_url = format!("https://{host}/{}", repo_path.join("/"));

            let repo = Arc::new(Repository::new(
                self.config.clone(),
                self.tuning.clone(),
                entry.path().to_path_buf(),
                upstream_url.clone(),
                RepoState::Ready,
                self.token_provider.clone(),
            ));

            if let Err(err) = repo.apply_mirror_config(cancel).await {
                warn!(
                    upstream = %upstream_url,
                    error = %err,
                    "failed to re-apply mirror config to discovered repository"
                );
            }

            self.repos
                .lock()
                .expect("manager lock poisoned")
                .insert(upstream_url, Arc::clone(&repo));
            discovered.push(repo);
        }

        if !discovered.is_empty() {
            info!(count = discovered.len(), "discovered existing mirrors");
        }
        Ok(discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &Path) -> Manager {
        Manager::new(
            GitCloneConfig {
                mirror_root: root.to_path_buf(),
                fetch_interval: Duration::from_secs(900),
                ref_check_interval: Duration::from_secs(10),
            },
            None,
        )
        .unwrap()
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok()
    }

    #[test]
    fn manager_requires_mirror_root() {
        let err = Manager::new(
            GitCloneConfig {
                mirror_root: PathBuf::new(),
                fetch_interval: Duration::from_secs(900),
                ref_check_interval: Duration::from_secs(10),
            },
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("mirror-root"));
    }

    #[test]
    fn get_or_create_derives_path_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let repo = manager.get_or_create("https://github.com/user/repo");
        assert_eq!(repo.upstream_url(), "https://github.com/user/repo");
        assert_eq!(repo.state(), RepoState::Empty);
        assert_eq!(
            repo.path(),
            dir.path().join("github.com").join("user").join("repo")
        );

        // Same URL, same instance.
        let again = manager.get_or_create("https://github.com/user/repo");
        assert!(Arc::ptr_eq(&repo, &again));
    }

    #[test]
    fn dot_git_suffix_is_stripped_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let repo = manager.get_or_create("https://github.com/user/repo.git");
        assert_eq!(
            repo.path(),
            dir.path().join("github.com").join("user").join("repo")
        );
    }

    #[test]
    fn existing_mirror_starts_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("github.com").join("user").join("repo");
        std::fs::create_dir_all(&mirror).unwrap();
        std::fs::write(mirror.join("HEAD"), "ref: refs/heads/main\n").unwrap();

        let manager = manager(dir.path());
        let repo = manager.get_or_create("https://github.com/user/repo");
        assert_eq!(repo.state(), RepoState::Ready);
    }

    #[test]
    fn get_returns_only_registered_repos() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(manager.get("https://github.com/user/repo").is_none());
        manager.get_or_create("https://github.com/user/repo");
        assert!(manager.get("https://github.com/user/repo").is_some());
    }

    #[tokio::test]
    async fn discover_registers_mirrors_and_skips_scratch_dirs() {
        let dir = tempfile::tempdir().unwrap();
        for path in [
            dir.path().join("github.com/user1/repo1"),
            dir.path().join("github.com/user2/repo2"),
            dir.path().join("gitlab.com/org/project"),
        ] {
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        }
        let spool = dir.path().join(".spools/github.com/user1/repo1");
        std::fs::create_dir_all(&spool).unwrap();
        std::fs::write(spool.join("HEAD"), "not a repo").unwrap();

        let manager = manager(dir.path());
        let cancel = CancellationToken::new();
        let discovered = manager.discover_existing(&cancel).await.unwrap();
        assert_eq!(discovered.len(), 3);

        for url in [
            "https://github.com/user1/repo1",
            "https://github.com/user2/repo2",
            "https://gitlab.com/org/project",
        ] {
            let repo = manager.get(url).unwrap();
            assert_eq!(repo.state(), RepoState::Ready);
        }
        assert!(manager.get("https://.spools/github.com/user1").is_none());
    }

    #[test]
    fn parse_git_refs_handles_blank_lines() {
        let output = "\nabc123 refs/heads/main\ndef456 refs/heads/develop\n789012 refs/tags/v1.0.0\n";
        let refs = parse_git_refs(output);
        assert_eq!(refs["refs/heads/main"], "abc123");
        assert_eq!(refs["refs/heads/develop"], "def456");
        assert_eq!(refs["refs/tags/v1.0.0"], "789012");
    }

    #[test]
    fn state_display() {
        assert_eq!(RepoState::Empty.to_string(), "empty");
        assert_eq!(RepoState::Cloning.to_string(), "cloning");
        assert_eq!(RepoState::Ready.to_string(), "ready");
    }

    #[tokio::test]
    async fn needs_fetch_tracks_last_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let repo = manager.get_or_create("https://github.com/user/repo");

        // Never fetched: always due.
        assert!(repo.needs_fetch(Duration::from_secs(900)));

        repo.meta.lock().unwrap().last_fetch = Some(Instant::now());
        assert!(!repo.needs_fetch(Duration::from_secs(900)));
        assert!(repo.needs_fetch(Duration::ZERO));
    }

    #[tokio::test]
    async fn clone_from_local_upstream_transitions_to_ready() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let upstream = dir.path().join("upstream");
        create_commit_repo(&upstream);

        let mirror_root = dir.path().join("mirrors");
        let manager = manager(&mirror_root);
        let upstream_url = url::Url::from_file_path(&upstream).unwrap().to_string();
        let repo = manager.get_or_create(&upstream_url);
        assert_eq!(repo.state(), RepoState::Empty);

        let cancel = CancellationToken::new();
        repo.clone_mirror(&cancel).await.unwrap();
        assert_eq!(repo.state(), RepoState::Ready);
        assert!(repo.path().join("HEAD").is_file());
        assert!(repo.last_fetch().is_some());

        // Mirror config was applied.
        let output = std::process::Command::new("git")
            .args(["-C", &repo.path().display().to_string(), "config", "gc.auto"])
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "0");

        let refs = repo.local_refs(&cancel).await.unwrap();
        assert!(refs.keys().any(|name| name.starts_with("refs/heads/")));

        let head = refs.values().next().unwrap().clone();
        assert!(repo.has_commit(&cancel, &head).await.unwrap());
        assert!(!repo
            .has_commit(&cancel, "0000000000000000000000000000000000000000")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ensure_refs_detects_upstream_divergence_and_fetches() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let upstream = dir.path().join("upstream");
        create_commit_repo(&upstream);

        let mirror_root = dir.path().join("mirrors");
        let manager = manager(&mirror_root);
        let upstream_url = url::Url::from_file_path(&upstream).unwrap().to_string();
        let repo = manager.get_or_create(&upstream_url);

        let cancel = CancellationToken::new();
        repo.clone_mirror(&cancel).await.unwrap();

        // In sync with upstream: the check finds nothing to do.
        repo.ensure_refs_up_to_date(&cancel).await.unwrap();

        // Advance upstream by one commit.
        let upstream_str = upstream.display().to_string();
        std::fs::write(upstream.join("new.txt"), "new\n").unwrap();
        for args in [
            vec!["-C", upstream_str.as_str(), "add", "."],
            vec!["-C", &upstream_str, "commit", "-m", "second"],
        ] {
            let output = std::process::Command::new("git").args(&args).output().unwrap();
            assert!(output.status.success());
        }
        let head = std::process::Command::new("git")
            .args(["-C", &upstream_str, "rev-parse", "HEAD"])
            .output()
            .unwrap();
        let new_sha = String::from_utf8_lossy(&head.stdout).trim().to_string();

        // Within the debounce window the stale check result is served and
        // the new commit stays unknown locally.
        repo.ensure_refs_up_to_date(&cancel).await.unwrap();
        assert!(!repo.has_commit(&cancel, &new_sha).await.unwrap());

        // Force the window open; the divergence triggers a fetch.
        {
            let mut meta = repo.meta.lock().unwrap();
            meta.ref_check_valid = false;
            meta.last_ref_check = None;
        }
        repo.ensure_refs_up_to_date(&cancel).await.unwrap();
        assert!(repo.has_commit(&cancel, &new_sha).await.unwrap());
    }

    #[tokio::test]
    async fn second_clone_call_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let repo = manager.get_or_create("https://github.com/user/repo");
        repo.meta.lock().unwrap().state = RepoState::Ready;

        // Already ready: no subprocess is spawned and the call succeeds.
        let cancel = CancellationToken::new();
        repo.clone_mirror(&cancel).await.unwrap();
        assert_eq!(repo.state(), RepoState::Ready);
    }

    /// Initialise a repo with one commit at `path`.
    fn create_commit_repo(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        for args in [
            vec!["init", "-b", "main", &path.display().to_string()],
            vec!["-C", &path.display().to_string(), "config", "user.email", "test@test.invalid"],
            vec!["-C", &path.display().to_string(), "config", "user.name", "Test"],
        ] {
            let output = std::process::Command::new("git").args(&args).output().unwrap();
            assert!(output.status.success(), "{:?}: {}", args, String::from_utf8_lossy(&output.stderr));
        }
        std::fs::write(path.join("hello.txt"), "hello\n").unwrap();
        for args in [
            vec!["-C", &path.display().to_string(), "add", "."],
            vec!["-C", &path.display().to_string(), "commit", "-m", "initial"],
        ] {
            let output = std::process::Command::new("git").args(&args).output().unwrap();
            assert!(output.status.success(), "{:?}: {}", args, String::from_utf8_lossy(&output.stderr));
        }
    }
}
