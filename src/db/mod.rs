// src/db/mod.rs

//! In-memory package database
//!
//! All known package variants live in one arena; lookups go through
//! name and provides indices of arena ids. Records are created when a
//! repository list or a status file is parsed and discarded wholesale when
//! a source is reloaded, so ids are stable for the lifetime of one loaded
//! generation and must not be held across [`PackageDb::remove_source`].

pub mod status;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::Config;
use crate::pkg::{Package, PkgStatus};

/// Stable index of a package variant within the current generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PkgId(usize);

/// Name-indexed collection of every known package variant
#[derive(Debug, Default)]
pub struct PackageDb {
    arena: Vec<Package>,
    /// package name -> variants with that name
    by_name: HashMap<String, Vec<PkgId>>,
    /// provided name -> variants declaring it in `Provides`
    by_provides: HashMap<String, Vec<PkgId>>,
}

impl PackageDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: PkgId) -> &Package {
        &self.arena[id.0]
    }

    pub fn get_mut(&mut self, id: PkgId) -> &mut Package {
        &mut self.arena[id.0]
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Insert one variant
    ///
    /// A variant duplicating an existing (name, version, architecture,
    /// source) key is rejected with a warning; the caller continues.
    pub fn add(&mut self, pkg: Package) -> Option<PkgId> {
        if pkg.name.is_empty() {
            warn!("Refusing to add a package record without a name");
            return None;
        }
        if let Some(ids) = self.by_name.get(&pkg.name) {
            let dup = ids.iter().any(|&id| {
                let other = self.get(id);
                other.version == pkg.version
                    && other.architecture == pkg.architecture
                    && other.source == pkg.source
            });
            if dup {
                warn!(
                    "Duplicate package record {} {} ({}), skipping",
                    pkg.name,
                    pkg.version_str(),
                    pkg.source.as_deref().unwrap_or("status")
                );
                return None;
            }
        }

        let id = PkgId(self.arena.len());
        self.by_name.entry(pkg.name.clone()).or_default().push(id);
        for clause in &pkg.provides {
            // a provides clause is a bare name, possibly with a constraint
            let provided = clause
                .split_whitespace()
                .next()
                .unwrap_or(clause)
                .to_string();
            self.by_provides.entry(provided).or_default().push(id);
        }
        self.arena.push(pkg);
        Some(id)
    }

    /// All known variants, in arena order
    pub fn fetch_available(&self) -> Vec<PkgId> {
        (0..self.arena.len()).map(PkgId).collect()
    }

    /// Variants sharing a name
    pub fn fetch_by_name(&self, name: &str) -> &[PkgId] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Variants declaring `name` in their `Provides` field
    pub fn fetch_providers(&self, name: &str) -> &[PkgId] {
        self.by_provides.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The single installed variant of `name`, if any
    pub fn fetch_installed_by_name(&self, name: &str) -> Option<PkgId> {
        self.fetch_by_name(name)
            .iter()
            .copied()
            .find(|&id| self.get(id).is_installed())
    }

    /// The single installed variant of `name` within one destination
    pub fn fetch_installed_by_name_dest(&self, name: &str, dest: &str) -> Option<PkgId> {
        self.fetch_by_name(name).iter().copied().find(|&id| {
            let pkg = self.get(id);
            pkg.is_installed() && pkg.dest.as_deref() == Some(dest)
        })
    }

    /// Best installation candidate for `name`
    ///
    /// Among non-installed variants: highest architecture priority first,
    /// then highest version; ties keep the earliest-declared source (the
    /// lower arena id, since lists load in declaration order).
    pub fn fetch_best_candidate(&self, name: &str) -> Option<PkgId> {
        let mut best: Option<PkgId> = None;
        for &id in self.fetch_by_name(name) {
            let pkg = self.get(id);
            if pkg.is_installed() {
                continue;
            }
            match best {
                None => best = Some(id),
                Some(cur) => {
                    let cur_pkg = self.get(cur);
                    let key = (pkg.arch_priority, &pkg.version);
                    let cur_key = (cur_pkg.arch_priority, &cur_pkg.version);
                    if key > cur_key {
                        best = Some(id);
                    }
                }
            }
        }
        best
    }

    /// Exact (name, rendered version) match, used to re-resolve a
    /// previously displayed selection
    pub fn fetch_by_name_version(&self, name: &str, version: &str) -> Option<PkgId> {
        self.fetch_by_name(name)
            .iter()
            .copied()
            .find(|&id| self.get(id).version_str() == version)
    }

    /// All installed variants, in arena order
    pub fn fetch_all_installed(&self) -> Vec<PkgId> {
        (0..self.arena.len())
            .map(PkgId)
            .filter(|&id| self.get(id).is_installed())
            .collect()
    }

    /// Discard every variant loaded from `source`, keeping installed-state
    /// records and rebuilding the indices
    pub fn remove_source(&mut self, source: &str) {
        let before = self.arena.len();
        let kept: Vec<Package> = std::mem::take(&mut self.arena)
            .into_iter()
            .filter(|pkg| pkg.source.as_deref() != Some(source))
            .collect();
        self.by_name.clear();
        self.by_provides.clear();
        for pkg in kept {
            self.add(pkg);
        }
        debug!(
            "Dropped {} records from source {}",
            before - self.arena.len(),
            source
        );
    }

    /// Load a downloaded list file, stamping each record with its source
    /// and architecture priority
    ///
    /// Records for unsupported architectures are skipped. Replaces any
    /// previous generation from the same source.
    pub fn load_list(&mut self, conf: &Config, source: &str, content: &str) -> usize {
        self.remove_source(source);

        let mut added = 0;
        for mut pkg in crate::pkg::parse::parse_records(content) {
            let Some(priority) = conf.arch_priority(&pkg.architecture) else {
                debug!(
                    "Skipping {} for unsupported architecture {}",
                    pkg.name, pkg.architecture
                );
                continue;
            };
            pkg.source = Some(source.to_string());
            pkg.arch_priority = priority;
            if self.add(pkg).is_some() {
                added += 1;
            }
        }
        debug!("Loaded {} records from source {}", added, source);
        added
    }

    /// Enforce the one-installed-variant-per-name invariant after loading
    ///
    /// Status files are authoritative, but a corrupt one could list two
    /// installed variants of a name in the same destination; the later one
    /// is demoted with a warning.
    pub fn dedupe_installed(&mut self) {
        let names: Vec<String> = self.by_name.keys().cloned().collect();
        for name in names {
            let mut seen: HashMap<String, PkgId> = HashMap::new();
            let installed: Vec<PkgId> = self
                .fetch_by_name(&name)
                .iter()
                .copied()
                .filter(|&id| self.get(id).is_installed())
                .collect();
            for id in installed {
                let dest = self.get(id).dest.clone().unwrap_or_default();
                if seen.contains_key(&dest) {
                    warn!(
                        "Multiple installed variants of {} in dest {}; keeping the first",
                        name, dest
                    );
                    self.get_mut(id).status = PkgStatus::NotInstalled;
                } else {
                    seen.insert(dest, id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::Package;

    fn pkg(name: &str, version: &str, arch: &str, source: &str) -> Package {
        let mut p = Package::new(name);
        p.version = Some(version.parse().unwrap());
        p.architecture = arch.to_string();
        p.source = Some(source.to_string());
        p.arch_priority = 10;
        p
    }

    #[test]
    fn test_add_and_fetch() {
        let mut db = PackageDb::new();
        let id = db.add(pkg("busybox", "1.36.1-r2", "armv7", "main")).unwrap();
        assert_eq!(db.get(id).name, "busybox");
        assert_eq!(db.fetch_by_name("busybox").len(), 1);
        assert!(db.fetch_by_name("nothere").is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut db = PackageDb::new();
        assert!(db.add(pkg("a", "1.0", "armv7", "main")).is_some());
        assert!(db.add(pkg("a", "1.0", "armv7", "main")).is_none());
        // same version from another source is a distinct variant
        assert!(db.add(pkg("a", "1.0", "armv7", "extra")).is_some());
        assert_eq!(db.fetch_by_name("a").len(), 2);
    }

    #[test]
    fn test_best_candidate_prefers_version() {
        let mut db = PackageDb::new();
        db.add(pkg("a", "1.0-1", "armv7", "main"));
        let newer = db.add(pkg("a", "1.1-1", "armv7", "extra")).unwrap();
        assert_eq!(db.fetch_best_candidate("a"), Some(newer));
    }

    #[test]
    fn test_best_candidate_prefers_arch_priority() {
        let mut db = PackageDb::new();
        let mut all = pkg("a", "2.0", "all", "main");
        all.arch_priority = 1;
        db.add(all);
        let native = db.add(pkg("a", "1.0", "armv7", "main")).unwrap();
        assert_eq!(db.fetch_best_candidate("a"), Some(native));
    }

    #[test]
    fn test_best_candidate_tie_keeps_first_source() {
        let mut db = PackageDb::new();
        let first = db.add(pkg("a", "1.0", "armv7", "main")).unwrap();
        db.add(pkg("a", "1.0", "armv7", "extra"));
        assert_eq!(db.fetch_best_candidate("a"), Some(first));
    }

    #[test]
    fn test_best_candidate_never_installed() {
        let mut db = PackageDb::new();
        let mut inst = pkg("a", "2.0", "armv7", "main");
        inst.status = PkgStatus::Installed;
        db.add(inst);
        let older = db.add(pkg("a", "1.0", "armv7", "main")).unwrap();
        assert_eq!(db.fetch_best_candidate("a"), Some(older));
        assert!(db.fetch_best_candidate("missing").is_none());
    }

    #[test]
    fn test_installed_lookup() {
        let mut db = PackageDb::new();
        db.add(pkg("a", "1.0", "armv7", "main"));
        let mut inst = pkg("a", "0.9", "armv7", "main");
        inst.status = PkgStatus::Installed;
        inst.dest = Some("root".to_string());
        inst.source = None;
        let inst_id = db.add(inst).unwrap();

        assert_eq!(db.fetch_installed_by_name("a"), Some(inst_id));
        assert_eq!(db.fetch_installed_by_name_dest("a", "root"), Some(inst_id));
        assert_eq!(db.fetch_installed_by_name_dest("a", "other"), None);
        assert_eq!(db.fetch_all_installed(), vec![inst_id]);
    }

    #[test]
    fn test_fetch_by_name_version() {
        let mut db = PackageDb::new();
        db.add(pkg("a", "1.0-1", "armv7", "main"));
        let id = db.add(pkg("a", "1.1-1", "armv7", "main")).unwrap();
        assert_eq!(db.fetch_by_name_version("a", "1.1-1"), Some(id));
        assert!(db.fetch_by_name_version("a", "9.9").is_none());
    }

    #[test]
    fn test_provides_index() {
        let mut db = PackageDb::new();
        let mut p = pkg("dropbear", "2022.83-1", "armv7", "main");
        p.provides = vec!["ssh-server".to_string()];
        let id = db.add(p).unwrap();
        assert_eq!(db.fetch_providers("ssh-server"), &[id]);
    }

    #[test]
    fn test_source_generation_reload() {
        let mut db = PackageDb::new();
        db.add(pkg("a", "1.0", "armv7", "main"));
        db.add(pkg("b", "1.0", "armv7", "extra"));
        let mut inst = pkg("c", "1.0", "armv7", "main");
        inst.source = None;
        inst.status = PkgStatus::Installed;
        db.add(inst);

        db.remove_source("main");
        assert!(db.fetch_by_name("a").is_empty());
        assert_eq!(db.fetch_by_name("b").len(), 1);
        // installed-state records are preserved across reloads
        assert!(db.fetch_installed_by_name("c").is_some());
    }

    #[test]
    fn test_dedupe_installed() {
        let mut db = PackageDb::new();
        for version in ["1.0", "1.1"] {
            let mut p = pkg("a", version, "armv7", "main");
            p.status = PkgStatus::Installed;
            p.dest = Some("root".to_string());
            p.source = Some(format!("src-{}", version));
            db.add(p);
        }
        db.dedupe_installed();
        let installed = db.fetch_all_installed();
        assert_eq!(installed.len(), 1);
    }
}
