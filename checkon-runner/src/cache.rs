// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Revision-keyed checkouts of downstream projects.
//!
//! The cache root is laid out as:
//!
//! * `checkouts/<revision>/`: the checkout itself.
//! * `checkouts/<revision>.lock`: held exclusively by whoever is using the checkout.
//! * `checkouts/<revision>.setup`: written once the tool's one-time setup has run.
//! * `tmp/`: fresh clones, on the same filesystem so they can be renamed into place.
//!
//! A checkout is only ever created by renaming a complete clone into place, so a partially
//! written checkout is never observed at the canonical path.

use crate::errors::{CacheDirError, CacheError, InvalidRevision};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use debug_ignore::DebugIgnore;
use etcetera::{BaseStrategy, choose_base_strategy};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{File, OpenOptions, TryLockError},
    io::Write,
    process::Stdio,
    str::FromStr,
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, info};

/// Environment variable to override the checkon cache directory.
pub const CHECKON_CACHE_DIR_ENV: &str = "CHECKON_CACHE_DIR";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Returns the default cache directory.
///
/// If `CHECKON_CACHE_DIR` is set, that is used. Otherwise this is the platform-specific cache
/// directory, for example `~/.cache/checkon` on Linux or `~/Library/Caches/checkon` on macOS.
pub fn default_cache_dir() -> Result<Utf8PathBuf, CacheDirError> {
    if let Ok(cache_dir) = std::env::var(CHECKON_CACHE_DIR_ENV) {
        return Ok(Utf8PathBuf::from(cache_dir));
    }
    let strategy = choose_base_strategy().map_err(|_| CacheDirError::BaseDirStrategy)?;
    let checkon_cache = strategy.cache_dir().join("checkon");
    Utf8PathBuf::from_path_buf(checkon_cache)
        .map_err(|path| CacheDirError::CacheDirNotUtf8 { path })
}

/// A full commit hash, used as the cache key for a checkout.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Returns the full hash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns an abbreviated hash for display.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for Revision {
    type Err = InvalidRevision;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if (s.len() == 40 || s.len() == 64) && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(InvalidRevision::new(s))
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A content-addressed store of project checkouts.
#[derive(Clone, Debug)]
pub struct WorkspaceCache {
    root: Utf8PathBuf,
    checkouts_dir: Utf8PathBuf,
    tmp_dir: Utf8PathBuf,
    git_program: String,
}

impl WorkspaceCache {
    /// Opens (creating if necessary) a cache rooted at `root`, cloning with `git_program`.
    pub fn new(
        root: impl Into<Utf8PathBuf>,
        git_program: impl Into<String>,
    ) -> Result<Self, CacheError> {
        let root = root.into();
        let checkouts_dir = root.join("checkouts");
        let tmp_dir = root.join("tmp");
        for dir in [&checkouts_dir, &tmp_dir] {
            std::fs::create_dir_all(dir).map_err(|err| CacheError::CreateDir {
                path: dir.clone(),
                err,
            })?;
        }
        Ok(Self {
            root,
            checkouts_dir,
            tmp_dir,
            git_program: git_program.into(),
        })
    }

    /// The cache root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The canonical checkout path for `revision`.
    pub fn checkout_path(&self, revision: &Revision) -> Utf8PathBuf {
        self.checkouts_dir.join(revision.as_str())
    }

    /// Clones `project_url`, and returns exclusive use of the checkout for the revision it is at.
    ///
    /// If a checkout for that revision already exists it is reused and the fresh clone is
    /// discarded. Waits for any other holder of the same revision to finish first. The returned
    /// [`Checkout`] holds the revision's lock until it is dropped.
    pub async fn acquire(&self, project_url: &str) -> Result<Checkout, CacheError> {
        let tmp = camino_tempfile::Builder::new()
            .prefix("clone-")
            .tempdir_in(&self.tmp_dir)
            .map_err(|err| CacheError::TempDir {
                path: self.tmp_dir.clone(),
                err,
            })?;
        let clone_dir = tmp.path().join("checkout");

        debug!("cloning {project_url} into {clone_dir}");
        let output = self
            .git(&["clone", "--quiet", "--", project_url, clone_dir.as_str()], None)
            .await?;
        if !output.status.success() {
            return Err(CacheError::CloneFailed {
                url: project_url.to_owned(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let output = self.git(&["rev-parse", "HEAD"], Some(&clone_dir)).await?;
        if !output.status.success() {
            return Err(CacheError::RevParseFailed {
                url: project_url.to_owned(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let revision: Revision = String::from_utf8_lossy(&output.stdout)
            .parse()
            .map_err(|err| CacheError::InvalidRevision {
                url: project_url.to_owned(),
                err,
            })?;

        let lock = RevisionLock::acquire(
            self.checkouts_dir.join(format!("{revision}.lock")),
            &revision,
        )
        .await?;

        let path = self.checkout_path(&revision);
        let reused = if path.exists() {
            true
        } else {
            match std::fs::rename(&clone_dir, &path) {
                Ok(()) => false,
                // Another process placed the same revision without holding the lock.
                Err(_) if path.exists() => true,
                Err(err) => {
                    return Err(CacheError::PlaceCheckout {
                        from: clone_dir,
                        to: path,
                        err,
                    });
                }
            }
        };
        if reused {
            debug!("reusing checkout of {project_url} at {}", revision.short());
        } else {
            debug!("placed checkout of {project_url} at {path}");
        }
        drop(tmp);

        Ok(Checkout {
            setup_marker: self.checkouts_dir.join(format!("{revision}.setup")),
            revision,
            path,
            reused,
            _lock: lock,
        })
    }

    async fn git(
        &self,
        args: &[&str],
        cwd: Option<&Utf8Path>,
    ) -> Result<std::process::Output, CacheError> {
        let mut command = Command::new(&self.git_program);
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        command.output().await.map_err(|err| CacheError::GitSpawn {
            program: self.git_program.clone(),
            err,
        })
    }
}

/// Exclusive use of one revision's checkout.
///
/// Dropping this releases the revision's lock.
#[derive(Debug)]
pub struct Checkout {
    revision: Revision,
    path: Utf8PathBuf,
    setup_marker: Utf8PathBuf,
    reused: bool,
    _lock: RevisionLock,
}

impl Checkout {
    /// The revision checked out.
    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    /// The checkout directory.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// True if an existing checkout was reused rather than a fresh clone placed.
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    /// True if the tool's one-time setup has not yet completed for this checkout.
    pub fn needs_setup(&self) -> bool {
        !self.setup_marker.exists()
    }

    /// Reads the record written when setup completed, if any.
    pub fn setup_record(&self) -> Result<Option<SetupRecord>, CacheError> {
        let contents = match std::fs::read_to_string(&self.setup_marker) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CacheError::SetupMarkerRead {
                    path: self.setup_marker.clone(),
                    err,
                });
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| CacheError::SetupMarkerRead {
                path: self.setup_marker.clone(),
                err: err.into(),
            })
    }

    /// Records that setup has run, whatever its outcome.
    pub fn mark_setup_complete(&self, exit_code: Option<i32>) -> Result<(), CacheError> {
        let record = SetupRecord {
            completed_at: Utc::now(),
            exit_code,
        };
        atomicwrites::AtomicFile::new(&self.setup_marker, atomicwrites::AllowOverwrite)
            .write(|file| {
                serde_json::to_writer(&mut *file, &record)?;
                file.write_all(b"\n")
            })
            .map_err(|err| CacheError::SetupMarkerWrite {
                path: self.setup_marker.clone(),
                err,
            })
    }
}

/// What was recorded when a checkout's one-time setup finished.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SetupRecord {
    /// When setup finished.
    pub completed_at: DateTime<Utc>,
    /// The setup exit code, or `None` if it was killed by a signal.
    pub exit_code: Option<i32>,
}

impl SetupRecord {
    /// True if setup exited successfully.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug)]
struct RevisionLock {
    path: Utf8PathBuf,
    // Held only for its lock, which is released when the file is closed.
    _file: DebugIgnore<File>,
}

impl RevisionLock {
    async fn acquire(path: Utf8PathBuf, revision: &Revision) -> Result<Self, CacheError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| CacheError::Lock {
                path: path.clone(),
                err,
            })?;

        let mut announced = false;
        loop {
            match file.try_lock() {
                Ok(()) => break,
                Err(TryLockError::WouldBlock) => {
                    if !announced {
                        info!(
                            "waiting for another run to release revision {}",
                            revision.short()
                        );
                        announced = true;
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(TryLockError::Error(err)) => {
                    return Err(CacheError::Lock { path, err });
                }
            }
        }
        debug!("locked {path}");

        Ok(Self {
            path,
            _file: DebugIgnore(file),
        })
    }
}

impl Drop for RevisionLock {
    fn drop(&mut self) {
        debug!("unlocking {}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("0123456789abcdef0123456789abcdef01234567", true ; "sha1")]
    #[test_case("0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF", true ; "sha256 uppercase")]
    #[test_case("0123456789abcdef0123456789abcdef01234567\n", true ; "trailing newline")]
    #[test_case("0123456", false ; "abbreviated")]
    #[test_case("main", false ; "branch name")]
    #[test_case("0123456789abcdef0123456789abcdef0123456g", false ; "not hex")]
    fn revision_parse(input: &str, valid: bool) {
        let parsed = input.parse::<Revision>();
        assert_eq!(parsed.is_ok(), valid, "parsed: {parsed:?}");
        if let Ok(revision) = parsed {
            assert!(revision.as_str().bytes().all(|b| !b.is_ascii_uppercase()));
            assert_eq!(revision.short().len(), 12);
        }
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use pretty_assertions::assert_eq;
        use camino_tempfile::Utf8TempDir;
        use std::os::unix::fs::PermissionsExt;

        const REVISION: &str = "0123456789abcdef0123456789abcdef01234567";

        fn fake_git(dir: &Utf8Path) -> Utf8PathBuf {
            let path = dir.join("fake-git");
            std::fs::write(
                &path,
                format!(
                    r#"#!/bin/sh
case "$1" in
  clone)
    for last; do :; done
    case "$*" in *broken*) echo "fatal: repository not found" >&2; exit 128;; esac
    mkdir -p "$last" && echo "print('hi')" > "$last/setup.py"
    ;;
  rev-parse)
    echo {REVISION}
    ;;
esac
"#
                ),
            )
            .unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn acquire_places_then_reuses() {
            let dir = Utf8TempDir::new().unwrap();
            let git = fake_git(dir.path());
            let cache = WorkspaceCache::new(dir.path().join("cache"), git.as_str()).unwrap();

            let first = cache.acquire("https://example.com/a/b").await.expect("clone works");
            assert_eq!(first.revision().as_str(), REVISION);
            assert!(!first.was_reused());
            assert!(first.path().join("setup.py").is_file());
            assert!(first.needs_setup());
            assert_eq!(first.setup_record().unwrap(), None);
            first.mark_setup_complete(Some(0)).unwrap();
            drop(first);

            let second = cache.acquire("https://example.com/a/b").await.expect("clone works");
            assert!(second.was_reused());
            assert_eq!(
                second.path(),
                cache.checkout_path(&REVISION.parse().unwrap()).as_path()
            );
            assert!(!second.needs_setup());
            let record = second.setup_record().unwrap().expect("marker was written");
            assert!(record.is_success());
            drop(second);

            // Fresh clones never linger in the temporary area.
            let leftovers: Vec<_> = cache.root().join("tmp").read_dir_utf8().unwrap().collect();
            assert!(leftovers.is_empty(), "leftover clones: {leftovers:?}");
        }

        #[tokio::test]
        async fn clone_failure_is_reported() {
            let dir = Utf8TempDir::new().unwrap();
            let git = fake_git(dir.path());
            let cache = WorkspaceCache::new(dir.path().join("cache"), git.as_str()).unwrap();

            let err = cache
                .acquire("https://example.com/broken")
                .await
                .expect_err("clone fails");
            match err {
                CacheError::CloneFailed {
                    exit_code, stderr, ..
                } => {
                    assert_eq!(exit_code, Some(128));
                    assert!(stderr.contains("repository not found"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn missing_program_is_reported() {
            let dir = Utf8TempDir::new().unwrap();
            let cache = WorkspaceCache::new(
                dir.path().join("cache"),
                dir.path().join("no-such-git").as_str(),
            )
            .unwrap();
            let err = cache
                .acquire("https://example.com/a/b")
                .await
                .expect_err("program is missing");
            assert!(matches!(err, CacheError::GitSpawn { .. }), "{err:?}");
        }
    }
}
