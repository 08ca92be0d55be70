// src/resolver.rs

//! Dependency resolution
//!
//! Expands a target package into the transitive closure of unsatisfied
//! dependencies using a deterministic greedy strategy: each clause is
//! satisfied by an installed package, an installed provider, or the best
//! installation candidate for the clause's name, in that order. First match
//! wins; there is no backtracking search over alternate providers. Visited
//! groups are tracked in a resolver-local set, so no state is left on the
//! shared records between calls.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, warn};

use crate::db::{PackageDb, PkgId};
use crate::version::{Relation, Version};

/// One parsed dependency clause: a name plus an optional constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub name: String,
    pub constraint: Option<(Relation, Version)>,
}

impl Clause {
    /// Parse `name` or `name (op version)`
    ///
    /// Returns `None` for clause text too mangled to extract a name from;
    /// an unparseable constraint degrades to name-only matching with a
    /// warning rather than failing the clause.
    pub fn parse(raw: &str) -> Option<Clause> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let Some(open) = raw.find('(') else {
            return Some(Clause {
                name: raw.split_whitespace().next()?.to_string(),
                constraint: None,
            });
        };

        let name = raw[..open].trim().to_string();
        if name.is_empty() {
            return None;
        }
        let inner = raw[open + 1..].trim_end_matches(')').trim();
        let mut toks = inner.split_whitespace();
        let constraint = match (toks.next(), toks.next()) {
            (Some(op), Some(ver)) => match (Relation::parse(op), ver.parse::<Version>()) {
                (Some(rel), Ok(version)) => Some((rel, version)),
                _ => {
                    warn!("Ignoring unparseable constraint in clause '{}'", raw);
                    None
                }
            },
            _ => {
                warn!("Ignoring unparseable constraint in clause '{}'", raw);
                None
            }
        };
        Some(Clause { name, constraint })
    }

    /// Whether a concrete version satisfies this clause
    pub fn satisfied_by(&self, version: Option<&Version>) -> bool {
        match (&self.constraint, version) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((rel, wanted)), Some(candidate)) => rel.satisfied_by(candidate, wanted),
        }
    }
}

/// Outcome of one resolution pass
#[derive(Debug, Default)]
pub struct Resolution {
    /// Candidates to download and install, in discovery order; the target
    /// itself is not included
    pub to_fetch: Vec<PkgId>,
    /// Clause strings no installed package, provider, or candidate could
    /// satisfy; non-empty means the resolution failed
    pub unresolved: Vec<String>,
}

impl Resolution {
    pub fn is_satisfied(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// How one clause was satisfied, if at all
enum Satisfaction {
    AlreadyMet,
    Candidate(PkgId),
    Unresolved,
}

/// Try to satisfy one clause against the database
fn satisfy_clause(db: &PackageDb, clause: &Clause) -> Satisfaction {
    // (a) an installed package with the clause's name
    if let Some(id) = db.fetch_installed_by_name(&clause.name) {
        if clause.satisfied_by(db.get(id).version.as_ref()) {
            return Satisfaction::AlreadyMet;
        }
    }

    // (b) an installed provider; first match wins, no alternate-provider
    // search
    for &id in db.fetch_providers(&clause.name) {
        if db.get(id).is_installed() {
            return Satisfaction::AlreadyMet;
        }
    }

    // (c) the best installation candidate by name, then by provided name
    if let Some(id) = db.fetch_best_candidate(&clause.name) {
        if clause.satisfied_by(db.get(id).version.as_ref()) {
            return Satisfaction::Candidate(id);
        }
    }
    for &id in db.fetch_providers(&clause.name) {
        if !db.get(id).is_installed() {
            return Satisfaction::Candidate(id);
        }
    }

    Satisfaction::Unresolved
}

/// Expand `target` into the ordered set of unsatisfied dependencies
///
/// Breadth-first over `pre_depends` then `depends`. Alternatives within a
/// clause (`a | b`) are satisfied by the first satisfiable alternative.
/// Idempotent: resolving twice against an unchanged database yields
/// identical output.
pub fn resolve(db: &PackageDb, target: PkgId) -> Resolution {
    let mut resolution = Resolution::default();
    // group identity: visited (name, architecture) pairs this pass
    let mut visited: HashSet<(String, String)> = HashSet::new();
    let mut queue: VecDeque<PkgId> = VecDeque::new();

    let root = db.get(target);
    visited.insert((root.name.clone(), root.architecture.clone()));
    queue.push_back(target);

    while let Some(id) = queue.pop_front() {
        let pkg = db.get(id);
        let clauses = pkg.pre_depends.iter().chain(pkg.depends.iter());

        for raw in clauses {
            let alternatives: Vec<Clause> = raw
                .split('|')
                .filter_map(Clause::parse)
                .collect();
            if alternatives.is_empty() {
                warn!("{}: ignoring malformed dependency clause '{}'", pkg.name, raw);
                continue;
            }

            if alternatives
                .iter()
                .any(|alt| visited.contains(&(alt.name.clone(), pkg.architecture.clone())))
            {
                // a previously chosen candidate covers this clause
                continue;
            }

            let mut chosen = None;
            let mut met = false;
            for alt in &alternatives {
                match satisfy_clause(db, alt) {
                    Satisfaction::AlreadyMet => {
                        met = true;
                        break;
                    }
                    Satisfaction::Candidate(id) => {
                        chosen = Some(id);
                        break;
                    }
                    Satisfaction::Unresolved => {}
                }
            }

            if met {
                continue;
            }
            match chosen {
                Some(dep_id) => {
                    let dep = db.get(dep_id);
                    let key = (dep.name.clone(), dep.architecture.clone());
                    if visited.insert(key) {
                        debug!("{} pulls in {} {}", pkg.name, dep.name, dep.version_str());
                        resolution.to_fetch.push(dep_id);
                        queue.push_back(dep_id);
                    }
                }
                None => {
                    debug!("{}: cannot satisfy '{}'", pkg.name, raw);
                    resolution.unresolved.push(raw.clone());
                }
            }
        }
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::{Package, PkgStatus};

    fn avail(db: &mut PackageDb, name: &str, version: &str, depends: &[&str]) -> PkgId {
        let mut pkg = Package::new(name);
        pkg.version = Some(version.parse().unwrap());
        pkg.architecture = "armv7".to_string();
        pkg.source = Some("main".to_string());
        pkg.arch_priority = 10;
        pkg.depends = depends.iter().map(|s| s.to_string()).collect();
        db.add(pkg).unwrap()
    }

    fn installed(db: &mut PackageDb, name: &str, version: &str) -> PkgId {
        let mut pkg = Package::new(name);
        pkg.version = Some(version.parse().unwrap());
        pkg.architecture = "armv7".to_string();
        pkg.dest = Some("root".to_string());
        pkg.status = PkgStatus::Installed;
        db.add(pkg).unwrap()
    }

    #[test]
    fn test_clause_parse() {
        let c = Clause::parse("libc (>= 1.0)").unwrap();
        assert_eq!(c.name, "libc");
        let (rel, ver) = c.constraint.unwrap();
        assert_eq!(rel, Relation::LaterEqual);
        assert_eq!(ver.to_string(), "1.0");

        let bare = Clause::parse("zlib").unwrap();
        assert_eq!(bare.name, "zlib");
        assert!(bare.constraint.is_none());

        assert!(Clause::parse("  ").is_none());
        // mangled constraint degrades to name-only
        let degraded = Clause::parse("zlib (banana)").unwrap();
        assert!(degraded.constraint.is_none());
    }

    #[test]
    fn test_clause_satisfaction() {
        let c = Clause::parse("libc (>= 1.2)").unwrap();
        assert!(c.satisfied_by(Some(&"1.2".parse().unwrap())));
        assert!(c.satisfied_by(Some(&"2.0".parse().unwrap())));
        assert!(!c.satisfied_by(Some(&"1.1".parse().unwrap())));
        assert!(!c.satisfied_by(None));
    }

    #[test]
    fn test_installed_dep_not_fetched() {
        let mut db = PackageDb::new();
        installed(&mut db, "baz", "1.0");
        avail(&mut db, "bar", "1.0", &[]);
        let foo = avail(&mut db, "foo", "1.0", &["bar", "baz"]);

        let bar = db.fetch_best_candidate("bar").unwrap();
        let res = resolve(&db, foo);
        assert!(res.is_satisfied());
        assert_eq!(res.to_fetch, vec![bar]);
    }

    #[test]
    fn test_transitive_expansion_in_discovery_order() {
        let mut db = PackageDb::new();
        avail(&mut db, "libc", "1.0", &[]);
        avail(&mut db, "zlib", "1.0", &["libc"]);
        let top = avail(&mut db, "app", "1.0", &["zlib"]);

        let res = resolve(&db, top);
        assert!(res.is_satisfied());
        let names: Vec<&str> = res
            .to_fetch
            .iter()
            .map(|&id| db.get(id).name.as_str())
            .collect();
        assert_eq!(names, vec!["zlib", "libc"]);
    }

    #[test]
    fn test_unresolved_clause_fails_resolution() {
        let mut db = PackageDb::new();
        let top = avail(&mut db, "app", "1.0", &["nonexistent (>= 2.0)"]);
        let res = resolve(&db, top);
        assert!(!res.is_satisfied());
        assert_eq!(res.unresolved, vec!["nonexistent (>= 2.0)"]);
        assert!(res.to_fetch.is_empty());
    }

    #[test]
    fn test_constraint_rejects_old_candidate() {
        let mut db = PackageDb::new();
        avail(&mut db, "lib", "1.0", &[]);
        let top = avail(&mut db, "app", "1.0", &["lib (>= 2.0)"]);
        let res = resolve(&db, top);
        assert!(!res.is_satisfied());
    }

    #[test]
    fn test_installed_provider_satisfies() {
        let mut db = PackageDb::new();
        let mut provider = Package::new("dropbear");
        provider.version = Some("2022.83".parse().unwrap());
        provider.architecture = "armv7".to_string();
        provider.provides = vec!["ssh-server".to_string()];
        provider.status = PkgStatus::Installed;
        db.add(provider);

        let top = avail(&mut db, "app", "1.0", &["ssh-server"]);
        let res = resolve(&db, top);
        assert!(res.is_satisfied());
        assert!(res.to_fetch.is_empty());
    }

    #[test]
    fn test_candidate_provider_is_fetched() {
        let mut db = PackageDb::new();
        let mut provider = Package::new("openssh");
        provider.version = Some("9.0".parse().unwrap());
        provider.architecture = "armv7".to_string();
        provider.source = Some("main".to_string());
        provider.arch_priority = 10;
        provider.provides = vec!["ssh-server".to_string()];
        let provider_id = db.add(provider).unwrap();

        let top = avail(&mut db, "app", "1.0", &["ssh-server"]);
        let res = resolve(&db, top);
        assert!(res.is_satisfied());
        assert_eq!(res.to_fetch, vec![provider_id]);
    }

    #[test]
    fn test_alternatives_first_satisfiable_wins() {
        let mut db = PackageDb::new();
        avail(&mut db, "second", "1.0", &[]);
        let top = avail(&mut db, "app", "1.0", &["first | second"]);
        let second = db.fetch_best_candidate("second").unwrap();
        let res = resolve(&db, top);
        assert!(res.is_satisfied());
        assert_eq!(res.to_fetch, vec![second]);
    }

    #[test]
    fn test_shared_dep_fetched_once() {
        let mut db = PackageDb::new();
        avail(&mut db, "libc", "1.0", &[]);
        avail(&mut db, "a", "1.0", &["libc"]);
        avail(&mut db, "b", "1.0", &["libc"]);
        let top = avail(&mut db, "app", "1.0", &["a", "b"]);

        let res = resolve(&db, top);
        assert!(res.is_satisfied());
        let libc_count = res
            .to_fetch
            .iter()
            .filter(|&&id| db.get(id).name == "libc")
            .count();
        assert_eq!(libc_count, 1);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut db = PackageDb::new();
        avail(&mut db, "libc", "1.0", &[]);
        avail(&mut db, "zlib", "1.0", &["libc"]);
        let top = avail(&mut db, "app", "1.0", &["zlib", "libc"]);

        let first = resolve(&db, top);
        let second = resolve(&db, top);
        assert_eq!(first.to_fetch, second.to_fetch);
        assert_eq!(first.unresolved, second.unresolved);
    }

    #[test]
    fn test_dependency_cycle_terminates() {
        let mut db = PackageDb::new();
        avail(&mut db, "a", "1.0", &["b"]);
        avail(&mut db, "b", "1.0", &["a"]);
        let top = avail(&mut db, "app", "1.0", &["a"]);

        let res = resolve(&db, top);
        assert!(res.is_satisfied());
        assert_eq!(res.to_fetch.len(), 2);
    }
}
