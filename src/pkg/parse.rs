// src/pkg/parse.rs

//! Control-file record parsing and rendering
//!
//! Repository list files and destination status files share one record
//! shape: `Field: value` lines, blank-line separated records, multi-line
//! `Description`, and (status files only) a `Status:` triple plus indented
//! `Conffiles:` continuation lines. Status files are a superset of the list
//! format, so one parser reads both.

use std::str::FromStr;

use tracing::warn;

use crate::error::{Error, Result};
use crate::pkg::{Conffile, Flags, Package, PkgStatus, Want};
use crate::version::Version;

/// Split a comma-separated relational field into clause strings
fn parse_clause_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a `Status: <want> <flags> <status>` value
fn parse_status(pkg: &mut Package, value: &str) {
    let mut toks = value.split_whitespace();
    let (Some(want), Some(flags), Some(status)) = (toks.next(), toks.next(), toks.next()) else {
        warn!("Failed to parse Status line for {}: '{}'", pkg.name, value);
        return;
    };

    match Want::from_str(want) {
        Ok(w) => pkg.want = w,
        Err(e) => warn!("{}: {}", pkg.name, e),
    }
    pkg.flags = Flags::parse(flags);
    match PkgStatus::from_str(status) {
        Ok(s) => pkg.status = s,
        Err(e) => warn!("{}: {}", pkg.name, e),
    }
}

/// Parse a `<path> <md5>` conffile continuation line
fn parse_conffile(pkg: &mut Package, line: &str) {
    let mut toks = line.split_whitespace();
    let (Some(path), Some(md5sum)) = (toks.next(), toks.next()) else {
        warn!("Failed to parse Conffiles line for {}: '{}'", pkg.name, line);
        return;
    };
    pkg.conffiles.push(Conffile {
        path: path.to_string(),
        md5sum: md5sum.to_string(),
    });
}

/// Byte sizes are stored rounded up to KiB
fn parse_size_kb(value: &str) -> u64 {
    let bytes: u64 = value.trim().parse().unwrap_or(0);
    bytes.div_ceil(1024)
}

/// Apply one `Field: value` pair to a package under construction
fn apply_field(pkg: &mut Package, field: &str, value: &str) {
    let value = value.trim();
    match field {
        "Package" => pkg.name = value.to_string(),
        "Version" => match Version::from_str(value) {
            Ok(v) => pkg.version = Some(v),
            Err(e) => warn!("{}: {}", pkg.name, e),
        },
        "Architecture" => pkg.architecture = value.to_string(),
        "Description" => pkg.description = value.to_string(),
        "Tags" => pkg.tags = value.to_string(),
        "Section" => pkg.section = value.to_string(),
        "Priority" => pkg.priority = value.to_string(),
        "Maintainer" => pkg.maintainer = value.to_string(),
        "Source" => pkg.source_pkg = value.to_string(),
        "Size" => pkg.size_kb = parse_size_kb(value),
        "Installed-Size" => pkg.installed_size_kb = parse_size_kb(value),
        "Installed-Time" => pkg.installed_time = value.parse().unwrap_or(0),
        // older writers used the wrong case for MD5sum; accept both
        "MD5sum" | "MD5Sum" => pkg.md5sum = value.to_string(),
        "SHA256sum" => pkg.sha256sum = value.to_string(),
        "Filename" => pkg.filename = value.to_string(),
        "Depends" => pkg.depends = parse_clause_list(value),
        "Pre-Depends" => pkg.pre_depends = parse_clause_list(value),
        "Recommends" => pkg.recommends = parse_clause_list(value),
        "Suggests" => pkg.suggests = parse_clause_list(value),
        "Conflicts" => pkg.conflicts = parse_clause_list(value),
        "Provides" => pkg.provides = parse_clause_list(value),
        "Replaces" => pkg.replaces = parse_clause_list(value),
        "Essential" => pkg.flags.essential = value == "yes",
        "Auto-Installed" => pkg.auto_installed = value == "yes",
        "Status" => parse_status(pkg, value),
        // descriptive fields we do not track are ignored
        _ => {}
    }
}

/// Parse every record in a control-file stream
pub fn parse_records(content: &str) -> Vec<Package> {
    let mut packages = Vec::new();
    let mut pkg = Package::new("");
    let mut reading_description = false;
    let mut reading_conffiles = false;

    for line in content.lines() {
        if line.trim().is_empty() {
            // end of record
            if !pkg.name.is_empty() {
                packages.push(std::mem::take(&mut pkg));
            }
            reading_description = false;
            reading_conffiles = false;
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            if reading_description {
                pkg.description.push('\n');
                pkg.description.push_str(line.trim());
            } else if reading_conffiles {
                parse_conffile(&mut pkg, line);
            }
            continue;
        }

        reading_description = false;
        reading_conffiles = false;

        let Some((field, value)) = line.split_once(':') else {
            warn!("Ignoring malformed control line: '{}'", line);
            continue;
        };
        let field = field.trim();
        match field {
            "Description" => {
                reading_description = true;
                apply_field(&mut pkg, field, value);
            }
            "Conffiles" => {
                reading_conffiles = true;
            }
            _ => apply_field(&mut pkg, field, value),
        }
    }

    if !pkg.name.is_empty() {
        packages.push(pkg);
    }

    packages
}

/// Render one package as a status-file record, blank-line terminated
///
/// Only the fields the status store owns are written; descriptive list
/// fields the next refresh would resupply are limited to the relational
/// set needed for offline dependency checks.
pub fn write_record(pkg: &Package, out: &mut String) {
    out.push_str("Package: ");
    out.push_str(&pkg.name);
    out.push('\n');

    if pkg.version.is_some() {
        out.push_str("Version: ");
        out.push_str(&pkg.version_str());
        out.push('\n');
    }

    for (field, clauses) in [
        ("Depends", &pkg.depends),
        ("Pre-Depends", &pkg.pre_depends),
        ("Provides", &pkg.provides),
        ("Replaces", &pkg.replaces),
        ("Conflicts", &pkg.conflicts),
    ] {
        if !clauses.is_empty() {
            out.push_str(field);
            out.push_str(": ");
            out.push_str(&clauses.join(", "));
            out.push('\n');
        }
    }

    out.push_str("Status: ");
    out.push_str(pkg.want.as_str());
    out.push(' ');
    out.push_str(&pkg.flags.render());
    out.push(' ');
    out.push_str(pkg.status.as_str());
    out.push('\n');

    if !pkg.architecture.is_empty() {
        out.push_str("Architecture: ");
        out.push_str(&pkg.architecture);
        out.push('\n');
    }

    if pkg.installed_time != 0 {
        out.push_str(&format!("Installed-Time: {}\n", pkg.installed_time));
    }

    if pkg.auto_installed {
        out.push_str("Auto-Installed: yes\n");
    }

    if !pkg.conffiles.is_empty() {
        out.push_str("Conffiles:\n");
        for cf in &pkg.conffiles {
            out.push_str(&format!(" {} {}\n", cf.path, cf.md5sum));
        }
    }

    out.push('\n');
}

/// Parse a full status or list file from disk
pub fn parse_file(path: &std::path::Path) -> Result<Vec<Package>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Parse(format!("Failed to read {}: {}", path.display(), e))
    })?;
    Ok(parse_records(&content))
}
