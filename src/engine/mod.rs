// src/engine/mod.rs

//! The transaction engine
//!
//! An [`Engine`] is an explicit context object owning the configuration,
//! the package database, the machine-wide lock, a per-session temporary
//! directory and the fetch/verify/unpack collaborators. Construction
//! acquires the lock and loads lists and status files; teardown releases
//! the lock and persists nothing implicitly.
//!
//! Every operation runs to completion on the calling thread; on success the
//! status files have been rewritten before the call returns. On failure the
//! in-memory database reflects the last completed step, and callers are
//! expected to discard the session (drop and reconstruct the engine) since
//! partial unpacking may have changed on-disk state beyond the engine's
//! ability to roll back.

pub mod progress;

use std::path::PathBuf;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::backend::{Backend, IpkBackend};
use crate::config::{Config, LockFile};
use crate::db::{status, PackageDb, PkgId};
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, HttpFetcher, UnsupportedVerifier, Verifier};
use crate::pkg::{PackageInfo, PkgStatus, Want};
use crate::resolver;

pub use progress::{Action, ProgressEvent, ProgressSink};

/// Share of install progress devoted to downloading
const DOWNLOAD_SHARE: u8 = 75;

/// One engine session
pub struct Engine {
    conf: Config,
    db: PackageDb,
    fetcher: Box<dyn Fetcher>,
    verifier: Box<dyn Verifier>,
    backend: Box<dyn Backend>,
    tmp_dir: TempDir,
    /// Non-fatal warnings collected across operations, oldest first
    warnings: Vec<String>,
    _lock: LockFile,
}

impl Engine {
    /// Construct a session with the default collaborators
    pub fn new(conf: Config) -> Result<Self> {
        let fetcher = HttpFetcher::new(
            conf.options.http_timeout_secs,
            conf.options.download_retries,
        )?;
        Self::with_parts(
            conf,
            Box::new(fetcher),
            Box::new(UnsupportedVerifier),
            Box::new(IpkBackend),
        )
    }

    /// Construct a session with caller-supplied collaborators
    ///
    /// Lock acquisition and temporary-directory creation are the only
    /// failures fatal to the whole session; everything later is returned
    /// per-operation.
    pub fn with_parts(
        mut conf: Config,
        fetcher: Box<dyn Fetcher>,
        verifier: Box<dyn Verifier>,
        backend: Box<dyn Backend>,
    ) -> Result<Self> {
        conf.finalize();

        let lock_path = conf.effective_dest()?.status_file.with_file_name("lock");
        let lock = LockFile::acquire(&lock_path)?;

        let tmp_dir = match &conf.options.tmp_dir {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                tempfile::Builder::new().prefix("parcel-").tempdir_in(base)?
            }
            None => tempfile::Builder::new().prefix("parcel-").tempdir()?,
        };

        let mut engine = Engine {
            conf,
            db: PackageDb::new(),
            fetcher,
            verifier,
            backend,
            tmp_dir,
            warnings: Vec::new(),
            _lock: lock,
        };
        engine.reload()?;
        Ok(engine)
    }

    /// Discard the in-memory database and reload every list and status file
    pub fn reload(&mut self) -> Result<()> {
        self.db = PackageDb::new();

        for source in self.conf.sources.clone() {
            let list_file = self.conf.lists_dir.join(&source.name);
            if !list_file.exists() {
                debug!("No list file for source {}", source.name);
                continue;
            }
            let content = std::fs::read_to_string(&list_file)?;
            self.db.load_list(&self.conf, &source.name, &content);
        }

        for dest in self.conf.dests.clone() {
            status::load(&mut self.db, &dest)?;
        }

        info!("Package database loaded: {} variants", self.db.len());
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.conf
    }

    pub fn db(&self) -> &PackageDb {
        &self.db
    }

    /// Non-fatal warnings collected so far, draining the list
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn push_warning(&mut self, msg: String) {
        warn!("{}", msg);
        self.warnings.push(msg);
    }

    fn send(
        sink: &mut dyn FnMut(&ProgressEvent),
        action: Action,
        package: Option<PackageInfo>,
        percent: u8,
    ) {
        sink(&ProgressEvent {
            action,
            package,
            percent,
        });
    }

    /// Install `name` together with its unsatisfied dependencies
    pub fn install(&mut self, name: &str, sink: ProgressSink) -> Result<()> {
        if self.db.fetch_installed_by_name(name).is_some() {
            return Err(Error::AlreadyInstalled(name.to_string()));
        }

        let target = self
            .db
            .fetch_best_candidate(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        self.db.get_mut(target).flags.user = true;

        Self::send(sink, Action::Install, Some(self.db.get(target).snapshot()), 0);

        let resolution = resolver::resolve(&self.db, target);
        if !resolution.is_satisfied() {
            return Err(Error::DependenciesFailed(resolution.unresolved));
        }

        // download dependencies first, then the target itself
        let mut queue = resolution.to_fetch;
        queue.push(target);
        self.download_queue(&queue, 0, DOWNLOAD_SHARE, sink)?;

        Self::send(sink, Action::Install, Some(self.db.get(target).snapshot()), DOWNLOAD_SHARE);

        if self.conf.options.noaction {
            info!("noaction is set, stopping before unpack");
            return Ok(());
        }

        for &id in &queue {
            self.unpack(id)?;
        }
        self.configure_packages()?;

        self.persist()?;
        Self::send(sink, Action::Install, Some(self.db.get(target).snapshot()), 100);
        Ok(())
    }

    /// Remove an installed package
    ///
    /// Other installed packages may still depend on the target; removal
    /// proceeds regardless.
    pub fn remove(&mut self, name: &str, sink: ProgressSink) -> Result<()> {
        let id = self
            .db
            .fetch_installed_by_name(name)
            .ok_or_else(|| Error::NotInstalled(name.to_string()))?;

        Self::send(sink, Action::Remove, Some(self.db.get(id).snapshot()), 0);

        // resolve the actual installed variant under the destination policy
        let id = match &self.conf.default_dest {
            Some(dest) => self
                .db
                .fetch_installed_by_name_dest(name, dest)
                .ok_or_else(|| Error::NotInstalled(name.to_string()))?,
            None => id,
        };

        Self::send(sink, Action::Remove, Some(self.db.get(id).snapshot()), 25);

        if self.conf.options.noaction {
            info!("noaction is set, stopping before removal");
            return Ok(());
        }

        let dest_name = self
            .db
            .get(id)
            .dest
            .clone()
            .ok_or_else(|| Error::Internal(format!("package {} has no dest", name)))?;
        let dest = self
            .conf
            .dest(&dest_name)
            .ok_or_else(|| Error::Config(format!("Unknown dest name: `{}`", dest_name)))?
            .clone();

        Self::send(sink, Action::Remove, Some(self.db.get(id).snapshot()), 75);

        self.backend
            .remove(self.db.get(id), &dest)
            .map_err(|e| Error::Internal(e.to_string()))?;
        status::remove_file_list(&dest, name);

        let pkg = self.db.get_mut(id);
        pkg.status = PkgStatus::NotInstalled;
        pkg.want = Want::Unknown;
        pkg.file_list.clear();
        pkg.installed_time = 0;

        self.persist()?;
        Self::send(sink, Action::Remove, Some(self.db.get(id).snapshot()), 100);
        Ok(())
    }

    /// Upgrade one installed package to its best candidate
    pub fn upgrade(&mut self, name: &str, sink: ProgressSink) -> Result<()> {
        let installed = match &self.conf.default_dest {
            Some(dest) => self.db.fetch_installed_by_name_dest(name, dest),
            None => self.db.fetch_installed_by_name(name),
        }
        .ok_or_else(|| Error::NotInstalled(name.to_string()))?;

        Self::send(sink, Action::Install, Some(self.db.get(installed).snapshot()), 0);

        let upgraded = self.upgrade_pkg(installed, sink)?;

        Self::send(sink, Action::Install, Some(self.db.get(installed).snapshot()), DOWNLOAD_SHARE);

        if upgraded {
            self.configure_packages()?;
            self.persist()?;
        }

        Self::send(sink, Action::Install, None, 100);
        Ok(())
    }

    /// Upgrade every installed package, best effort
    ///
    /// Per-package failures are counted and collected without stopping the
    /// loop; the shared configure pass runs once at the end. Succeeds only
    /// if both report zero failures.
    pub fn upgrade_all(&mut self, sink: ProgressSink) -> Result<()> {
        Self::send(sink, Action::Install, None, 0);

        let active = self.prepare_upgrade_list();
        let total = active.len().max(1);
        let mut failures = 0;

        for (i, id) in active.iter().enumerate() {
            Self::send(
                sink,
                Action::Install,
                Some(self.db.get(*id).snapshot()),
                (99 * i / total) as u8,
            );
            if let Err(e) = self.upgrade_pkg(*id, sink) {
                let name = self.db.get(*id).name.clone();
                self.push_warning(format!("Upgrade of {} failed: {}", name, e));
                failures += 1;
            }
        }

        let configure_result = if self.conf.options.noaction {
            Ok(())
        } else {
            self.configure_packages()
        };

        // persist whatever succeeded even when some upgrades failed
        self.persist()?;

        if failures > 0 {
            return Err(Error::Internal(format!("{} upgrades failed", failures)));
        }
        configure_result?;

        Self::send(sink, Action::Install, None, 100);
        Ok(())
    }

    /// Refresh every configured source's package list, then reload
    pub fn update_lists(&mut self, sink: ProgressSink) -> Result<()> {
        Self::send(sink, Action::Download, None, 0);

        let lists_dir = self.conf.lists_dir.clone();
        if lists_dir.exists() && !lists_dir.is_dir() {
            return Err(Error::Config(format!(
                "{} exists but is not a directory",
                lists_dir.display()
            )));
        }
        std::fs::create_dir_all(&lists_dir)?;

        let run_tmp = tempfile::Builder::new()
            .prefix("update-")
            .tempdir_in(self.tmp_dir.path())?;

        let sources = self.conf.sources.clone();
        let total = sources.len().max(1);
        let mut any_failed = false;

        for (done, source) in sources.iter().enumerate() {
            let url = source.list_url();
            let list_file = lists_dir.join(&source.name);
            let start = (100 * done / total) as u8;
            let end = (100 * (done + 1) / total) as u8;

            let result = if source.gzip {
                let tmp_gz = run_tmp.path().join(format!("{}.gz", source.name));
                let mut cb = |pct: u8| {
                    Self::send(sink, Action::Download, None, progress::rescale(start, end, pct));
                };
                self.fetcher
                    .fetch(&url, &tmp_gz, Some(&mut cb))
                    .and_then(|_| crate::fetch::gunzip_file(&tmp_gz, &list_file))
            } else {
                let mut cb = |pct: u8| {
                    Self::send(sink, Action::Download, None, progress::rescale(start, end, pct));
                };
                self.fetcher.fetch(&url, &list_file, Some(&mut cb))
            };

            if let Err(e) = result {
                self.push_warning(format!("Failed to update source {}: {}", source.name, e));
                any_failed = true;
            } else if self.conf.options.check_signature {
                if let Err(e) = self.check_list_signature(source, &list_file) {
                    if self.conf.options.signature_mandatory {
                        self.push_warning(format!(
                            "Signature check failed for {}: {}",
                            source.name, e
                        ));
                        any_failed = true;
                    } else {
                        self.push_warning(format!(
                            "Signature check failed for {} (ignored): {}",
                            source.name, e
                        ));
                    }
                }
            }

            Self::send(sink, Action::Download, None, (100 * (done + 1) / total) as u8);
        }

        // bulk list replacement: rebuilding from scratch is the only way to
        // guarantee index consistency
        self.reload()?;

        if any_failed {
            return Err(Error::DownloadFailed(
                "one or more sources failed to update".to_string(),
            ));
        }
        Ok(())
    }

    /// Fetch and verify a source's detached list signature
    fn check_list_signature(
        &mut self,
        source: &crate::config::Source,
        list_file: &std::path::Path,
    ) -> Result<()> {
        let sig_file = list_file.with_extension("sig");
        // never verify against a stale signature
        let _ = std::fs::remove_file(&sig_file);
        self.fetcher.fetch(&source.sig_url(), &sig_file, None)?;
        self.verifier.verify(list_file, &sig_file)
    }

    /// The Active List: every installed package, in database order
    ///
    /// Eligibility filtering (is there actually a newer candidate?) happens
    /// per entry in the upgrade paths.
    pub fn prepare_upgrade_list(&self) -> Vec<PkgId> {
        self.db.fetch_all_installed()
    }

    /// Report a snapshot of every known package variant
    pub fn list_packages(&self, mut cb: impl FnMut(PackageInfo)) {
        for id in self.db.fetch_available() {
            cb(self.db.get(id).snapshot());
        }
    }

    /// Report the best candidate for every installed package with a
    /// strictly newer candidate available
    pub fn list_upgradable(&self, mut cb: impl FnMut(PackageInfo)) {
        for id in self.prepare_upgrade_list() {
            let old = self.db.get(id);
            let Some(new_id) = self.db.fetch_best_candidate(&old.name) else {
                continue;
            };
            let new = self.db.get(new_id);
            if new.version > old.version {
                cb(new.snapshot());
            }
        }
    }

    /// Exact-match lookup for re-resolving a previously displayed selection
    pub fn find_package(
        &self,
        name: &str,
        version: Option<&str>,
        arch: Option<&str>,
        repo: Option<&str>,
    ) -> Option<PackageInfo> {
        for &id in self.db.fetch_by_name(name) {
            let pkg = self.db.get(id);
            if let Some(version) = version {
                if pkg.version_str() != version {
                    continue;
                }
            }
            if let Some(arch) = arch {
                if pkg.architecture != arch {
                    continue;
                }
            }
            if let Some(repo) = repo {
                if pkg.source.as_deref() != Some(repo) {
                    continue;
                }
            }
            return Some(pkg.snapshot());
        }
        None
    }

    /// Download every queued package into the session temp dir, each
    /// contributing an equal slice of `[start, end]`
    fn download_queue(
        &mut self,
        queue: &[PkgId],
        start: u8,
        end: u8,
        sink: ProgressSink,
    ) -> Result<()> {
        let total = queue.len().max(1);
        for (i, &id) in queue.iter().enumerate() {
            if !self.db.get(id).local_filename.is_empty() {
                continue;
            }

            let pkg = self.db.get(id);
            let snapshot = pkg.snapshot();
            let source_name = pkg
                .source
                .clone()
                .ok_or_else(|| Error::NotAvailable(pkg.name.clone()))?;
            let source = self
                .conf
                .source(&source_name)
                .ok_or_else(|| Error::NotAvailable(pkg.name.clone()))?;

            let filename = pkg.filename.trim_start_matches("./").to_string();
            let url = format!("{}/{}", source.url.trim_end_matches('/'), filename);
            let basename = filename.rsplit('/').next().unwrap_or(&filename).to_string();
            let local: PathBuf = self.tmp_dir.path().join(basename);

            let slice_start = progress::rescale(start, end, (100 * i / total) as u8);
            let slice_end = progress::rescale(start, end, (100 * (i + 1) / total) as u8);
            let mut cb = |pct: u8| {
                Self::send(
                    sink,
                    Action::Download,
                    Some(snapshot.clone()),
                    progress::rescale(slice_start, slice_end, pct),
                );
            };
            self.fetcher.fetch(&url, &local, Some(&mut cb))?;

            let sha256 = self.db.get(id).sha256sum.clone();
            if !sha256.is_empty() {
                crate::fetch::verify_sha256(&local, &sha256)
                    .map_err(|e| Error::DownloadFailed(e.to_string()))?;
            }

            self.db.get_mut(id).local_filename = local.to_string_lossy().into_owned();
        }
        Ok(())
    }

    /// Unpack one downloaded package into the effective destination
    fn unpack(&mut self, id: PkgId) -> Result<()> {
        let dest = self.conf.effective_dest()?.clone();
        let files = self
            .backend
            .unpack(self.db.get(id), &dest)
            .map_err(|e| Error::Internal(e.to_string()))?;

        let pkg = self.db.get_mut(id);
        debug!("Unpacked {} {}", pkg.name, pkg.version_str());
        pkg.status = PkgStatus::Unpacked;
        pkg.want = Want::Install;
        pkg.dest = Some(dest.name.clone());
        pkg.file_list = files;

        // the previously installed variant of this group, if any, has been
        // replaced on disk
        let name = self.db.get(id).name.clone();
        let replaced: Vec<PkgId> = self
            .db
            .fetch_by_name(&name)
            .iter()
            .copied()
            .filter(|&other| other != id && self.db.get(other).is_installed())
            .collect();
        for other in replaced {
            let old = self.db.get_mut(other);
            old.status = PkgStatus::NotInstalled;
            old.want = Want::Unknown;
            old.file_list.clear();
        }
        Ok(())
    }

    /// Run deferred configuration for every unpacked package database-wide
    ///
    /// Handles install-order dependencies: everything is on disk before any
    /// configure script runs. The pass continues past failures and returns
    /// the first error.
    fn configure_packages(&mut self) -> Result<()> {
        let mut first_err = None;

        for id in self.db.fetch_available() {
            if self.db.get(id).status != PkgStatus::Unpacked {
                continue;
            }
            let dest_name = self.db.get(id).dest.clone().unwrap_or_default();
            let Some(dest) = self.conf.dest(&dest_name).cloned() else {
                first_err.get_or_insert_with(|| {
                    Error::Internal(format!(
                        "package {} has unknown dest `{}`",
                        self.db.get(id).name,
                        dest_name
                    ))
                });
                continue;
            };

            match self.backend.configure(self.db.get(id), &dest) {
                Ok(()) => {
                    let pkg = self.db.get_mut(id);
                    pkg.status = PkgStatus::Installed;
                    pkg.flags.prefer = false;
                    pkg.installed_time = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    info!("Configured {}", pkg.name);
                }
                Err(e) => {
                    let name = self.db.get(id).name.clone();
                    warn!("Configuration of {} failed: {}", name, e);
                    first_err.get_or_insert(Error::Internal(format!(
                        "configuration of {} failed: {}",
                        name, e
                    )));
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The shared per-package upgrade body: resolve, download and unpack
    /// the best candidate of an installed package
    ///
    /// Returns `Ok(false)` when the package is already at its best
    /// candidate. Configuration and persistence are the caller's job so
    /// `upgrade_all` can batch them.
    fn upgrade_pkg(&mut self, installed: PkgId, sink: ProgressSink) -> Result<bool> {
        let name = self.db.get(installed).name.clone();
        let Some(candidate) = self.db.fetch_best_candidate(&name) else {
            debug!("No candidate for {}, leaving as is", name);
            return Ok(false);
        };

        if self.db.get(candidate).version <= self.db.get(installed).version {
            debug!("{} is already at its newest available version", name);
            return Ok(false);
        }

        let resolution = resolver::resolve(&self.db, candidate);
        if !resolution.is_satisfied() {
            return Err(Error::DependenciesFailed(resolution.unresolved));
        }

        let mut queue = resolution.to_fetch;
        queue.push(candidate);
        self.download_queue(&queue, 0, DOWNLOAD_SHARE, sink)?;

        if self.conf.options.noaction {
            return Ok(false);
        }

        // carry install provenance over from the variant being replaced
        let (user, auto) = {
            let old = self.db.get(installed);
            (old.flags.user, old.auto_installed)
        };
        for &id in &queue {
            self.unpack(id)?;
        }
        {
            let new = self.db.get_mut(candidate);
            new.flags.user = user;
            new.auto_installed = auto;
        }
        Ok(true)
    }

    /// Write every destination's status file and file lists
    fn persist(&mut self) -> Result<()> {
        if self.conf.options.noaction {
            debug!("noaction is set, not writing status files");
            return Ok(());
        }
        status::write_all(&self.db, &self.conf.dests)
    }
}
