// src/db/status.rs

//! Durable installed-state storage
//!
//! Each destination owns one status file in the control-file format. The
//! file is regenerated from in-memory state in a single pass at the end of
//! every successful transaction, never patched incrementally; writing goes
//! through a temporary sibling and an atomic rename so an interrupted write
//! leaves the previous file intact.

use std::fs;
use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::config::Destination;
use crate::db::{PackageDb, PkgId};
use crate::error::{Error, Result};
use crate::pkg::{parse, PkgStatus, Want};

/// Load a destination's status file and merge its records into the
/// database as the authoritative installed variants
///
/// A missing status file is an empty installed set, not an error.
pub fn load(db: &mut PackageDb, dest: &Destination) -> Result<usize> {
    if !dest.status_file.exists() {
        debug!(
            "No status file at {}, destination {} starts empty",
            dest.status_file.display(),
            dest.name
        );
        return Ok(0);
    }

    let packages = parse::parse_file(&dest.status_file)?;
    let mut loaded = 0;
    for mut pkg in packages {
        pkg.dest = Some(dest.name.clone());
        pkg.file_list = read_file_list(dest, &pkg.name);
        if db.add(pkg).is_some() {
            loaded += 1;
        }
    }
    db.dedupe_installed();
    info!(
        "Loaded {} status records for destination {}",
        loaded, dest.name
    );
    Ok(loaded)
}

/// Whether a package carries state worth persisting
///
/// Uninstalled packages nobody wants (or wants gone) have nothing
/// meaningful to record.
fn worth_persisting(db: &PackageDb, id: PkgId) -> bool {
    let pkg = db.get(id);
    !(pkg.status == PkgStatus::NotInstalled
        && matches!(pkg.want, Want::Unknown | Want::Deinstall | Want::Purge))
}

/// Regenerate every destination's status file from current in-memory state
///
/// All-or-nothing per file: a failure to write one destination is reported
/// but does not prevent writing the others. A persistable package without
/// an assigned destination is an internal-consistency error, reported and
/// skipped.
pub fn write_all(db: &PackageDb, dests: &[Destination]) -> Result<()> {
    let mut failed = None;

    for dest in dests {
        let mut out = String::new();
        for id in db.fetch_available() {
            if !worth_persisting(db, id) {
                continue;
            }
            let pkg = db.get(id);
            match &pkg.dest {
                Some(name) if *name == dest.name => parse::write_record(pkg, &mut out),
                Some(_) => {}
                None => {
                    error!("Internal error: package {} has no dest", pkg.name);
                }
            }
        }

        if let Err(e) = write_atomically(&dest.status_file, &out) {
            error!(
                "Can't write status file {}: {}",
                dest.status_file.display(),
                e
            );
            failed.get_or_insert(e);
            continue;
        }
        debug!("Wrote status file {}", dest.status_file.display());

        if let Err(e) = write_file_lists(db, dest) {
            warn!("Failed to write file lists for {}: {}", dest.name, e);
            failed.get_or_insert(e);
        }
    }

    match failed {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Write `content` to `path` via a temporary sibling and rename
fn write_atomically(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Persist each installed package's file list under the info dir
fn write_file_lists(db: &PackageDb, dest: &Destination) -> Result<()> {
    for id in db.fetch_all_installed() {
        let pkg = db.get(id);
        if pkg.dest.as_deref() != Some(dest.name.as_str()) || pkg.file_list.is_empty() {
            continue;
        }
        let path = dest.info_dir.join(format!("{}.list", pkg.name));
        let mut content = pkg.file_list.join("\n");
        content.push('\n');
        write_atomically(&path, &content)?;
    }
    Ok(())
}

/// Read a package's recorded file list, if one exists
pub fn read_file_list(dest: &Destination, name: &str) -> Vec<String> {
    let path = dest.info_dir.join(format!("{}.list", name));
    match fs::read_to_string(&path) {
        Ok(content) => content.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}

/// Remove a package's file list after removal
pub fn remove_file_list(dest: &Destination, name: &str) {
    let path = dest.info_dir.join(format!("{}.list", name));
    if path.exists() {
        if let Err(e) = fs::remove_file(&path) {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
