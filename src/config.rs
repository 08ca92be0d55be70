// src/config.rs

//! Engine configuration: sources, destinations, architectures, options
//!
//! Configuration is plain text, one declaration per line:
//!
//! ```text
//! src      <name> <url> [subpath]
//! src/gz   <name> <url> [subpath]
//! dest     <name> <root-dir>
//! lists_dir <path>
//! arch     <name> <priority>
//! option   <name> [<value>]
//! ```
//!
//! Unknown or malformed lines are reported and skipped; a structurally
//! invalid line aborts loading of that file only. The configuration is owned
//! by the engine context, never global.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A configured remote repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub url: String,
    /// Optional path segment between the base URL and the list file
    pub subpath: Option<String>,
    /// Whether the remote list file is gzip compressed (`src/gz`)
    pub gzip: bool,
}

impl Source {
    /// URL of the package list file for this source
    pub fn list_url(&self) -> String {
        let list = if self.gzip { "Packages.gz" } else { "Packages" };
        match &self.subpath {
            Some(sub) => format!("{}/{}/{}", self.url.trim_end_matches('/'), sub, list),
            None => format!("{}/{}", self.url.trim_end_matches('/'), list),
        }
    }

    /// URL of the detached signature for this source's list file
    pub fn sig_url(&self) -> String {
        match &self.subpath {
            Some(sub) => format!("{}/{}/Packages.sig", self.url.trim_end_matches('/'), sub),
            None => format!("{}/Packages.sig", self.url.trim_end_matches('/')),
        }
    }
}

/// An install root plus its status-file and list locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub name: String,
    pub root_dir: PathBuf,
    pub status_file: PathBuf,
    pub lists_dir: PathBuf,
    /// Per-package file lists and maintainer scripts live here
    pub info_dir: PathBuf,
}

impl Destination {
    pub fn new(name: impl Into<String>, root_dir: impl Into<PathBuf>, lists_dir: &Path) -> Self {
        let root_dir = root_dir.into();
        let state_dir = root_dir.join("usr/lib/parcel");
        Destination {
            name: name.into(),
            status_file: state_dir.join("status"),
            info_dir: state_dir.join("info"),
            lists_dir: lists_dir.to_path_buf(),
            root_dir,
        }
    }
}

/// Supported architecture with its candidate-selection priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchPriority {
    pub arch: String,
    pub priority: u32,
}

/// Typed `option` values the engine consults
#[derive(Debug, Clone)]
pub struct Options {
    pub tmp_dir: Option<PathBuf>,
    pub check_signature: bool,
    /// Escalate a signature failure from warning to error
    pub signature_mandatory: bool,
    pub force_depends: bool,
    /// Report what would happen without mutating anything
    pub noaction: bool,
    pub http_timeout_secs: u64,
    pub download_retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            tmp_dir: None,
            check_signature: false,
            signature_mandatory: false,
            force_depends: false,
            noaction: false,
            http_timeout_secs: 30,
            download_retries: 3,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub sources: Vec<Source>,
    pub dests: Vec<Destination>,
    pub arch_list: Vec<ArchPriority>,
    pub lists_dir: PathBuf,
    pub options: Options,
    /// When set, operations are restricted to this destination
    pub default_dest: Option<String>,
}

impl Config {
    /// Start from built-in defaults; `finalize` fills in anything a config
    /// file did not provide
    pub fn new() -> Self {
        Config {
            sources: Vec::new(),
            dests: Vec::new(),
            arch_list: Vec::new(),
            lists_dir: PathBuf::from("/var/lib/parcel/lists"),
            options: Options::default(),
            default_dest: None,
        }
    }

    /// Load configuration from a file, merging into `self`
    ///
    /// Individual bad lines are skipped with a warning; an I/O failure
    /// aborts this file only.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        info!("Loading conf file {}", path.display());
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to open {}: {}", path.display(), e)))?;

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Err(e) = self.apply_line(line) {
                warn!("{}:{}: {}", path.display(), lineno + 1, e);
            }
        }
        Ok(())
    }

    fn apply_line(&mut self, line: &str) -> Result<()> {
        let mut toks = tokenize(line).into_iter();
        let kind = toks
            .next()
            .ok_or_else(|| Error::Config("empty declaration".to_string()))?;

        match kind.as_str() {
            "src" | "src/gz" => {
                let (name, url) = (toks.next(), toks.next());
                let (Some(name), Some(url)) = (name, url) else {
                    return Err(Error::Config(format!("Invalid line: `{}`", line)));
                };
                if self.sources.iter().any(|s| s.name == name) {
                    warn!("Duplicate src declaration ({} {}). Skipping.", name, url);
                    return Ok(());
                }
                self.sources.push(Source {
                    name,
                    url,
                    subpath: toks.next(),
                    gzip: kind == "src/gz",
                });
            }
            "dest" => {
                let (Some(name), Some(root)) = (toks.next(), toks.next()) else {
                    return Err(Error::Config(format!("Invalid line: `{}`", line)));
                };
                // directories are computed in finalize, once lists_dir is known
                self.dests.push(Destination::new(name, root, &self.lists_dir));
            }
            "lists_dir" => {
                // accepted both bare (`lists_dir <path>`) and with the
                // legacy name token (`lists_dir ext <path>`)
                let rest: Vec<String> = toks.collect();
                let Some(path) = rest.last() else {
                    return Err(Error::Config(format!("Invalid line: `{}`", line)));
                };
                self.lists_dir = PathBuf::from(path);
            }
            "arch" => {
                let Some(arch) = toks.next() else {
                    return Err(Error::Config(format!("Invalid line: `{}`", line)));
                };
                let priority = match toks.next() {
                    Some(p) => p
                        .parse()
                        .map_err(|_| Error::Config(format!("Invalid arch priority: {}", p)))?,
                    None => {
                        warn!("No priority given for architecture {}, defaulting to 10", arch);
                        10
                    }
                };
                debug!("Supported arch {} priority {}", arch, priority);
                self.arch_list.push(ArchPriority { arch, priority });
            }
            "option" => {
                let Some(name) = toks.next() else {
                    return Err(Error::Config(format!("Invalid line: `{}`", line)));
                };
                self.set_option(&name, toks.next().as_deref())?;
            }
            other => {
                return Err(Error::Config(format!(
                    "Ignoring unknown configuration parameter: {}",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Set one named option, warning on duplicates and unknown names
    pub fn set_option(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        let need = |value: Option<&str>| {
            value
                .map(str::to_string)
                .ok_or_else(|| Error::Config(format!("Option {} needs an argument", name)))
        };
        match name {
            "tmp_dir" => self.options.tmp_dir = Some(PathBuf::from(need(value)?)),
            "check_signature" => self.options.check_signature = true,
            "signature_mandatory" => self.options.signature_mandatory = true,
            "force_depends" => self.options.force_depends = true,
            "test" | "noaction" => self.options.noaction = true,
            "http_timeout" => {
                self.options.http_timeout_secs = need(value)?
                    .parse()
                    .map_err(|_| Error::Config("Invalid http_timeout value".to_string()))?
            }
            "download_retries" => {
                self.options.download_retries = need(value)?
                    .parse()
                    .map_err(|_| Error::Config("Invalid download_retries value".to_string()))?
            }
            other => {
                warn!("Unrecognized option: {}", other);
            }
        }
        Ok(())
    }

    /// Fill in defaults for anything the config files left unset
    ///
    /// Mirrors engine init: at least one destination always exists, and an
    /// empty arch table defaults to all/noarch plus the host architecture.
    pub fn finalize(&mut self) {
        if self.arch_list.is_empty() {
            self.arch_list.push(ArchPriority {
                arch: "all".to_string(),
                priority: 1,
            });
            self.arch_list.push(ArchPriority {
                arch: "noarch".to_string(),
                priority: 1,
            });
            self.arch_list.push(ArchPriority {
                arch: std::env::consts::ARCH.to_string(),
                priority: 10,
            });
        }
        if self.dests.is_empty() {
            self.dests.push(Destination::new("root", "/", &self.lists_dir));
        }
        // recompute dest lists dirs in case lists_dir came after dest lines
        for dest in &mut self.dests {
            dest.lists_dir = self.lists_dir.clone();
        }
    }

    /// Priority of an architecture, `None` when unsupported
    pub fn arch_priority(&self, arch: &str) -> Option<u32> {
        self.arch_list
            .iter()
            .find(|a| a.arch == arch)
            .map(|a| a.priority)
    }

    pub fn source(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn dest(&self, name: &str) -> Option<&Destination> {
        self.dests.iter().find(|d| d.name == name)
    }

    /// The destination transactions commit to: the configured default, or
    /// the first declared
    pub fn effective_dest(&self) -> Result<&Destination> {
        match &self.default_dest {
            Some(name) => self
                .dest(name)
                .ok_or_else(|| Error::Config(format!("Unknown dest name: `{}`", name))),
            None => self
                .dests
                .first()
                .ok_or_else(|| Error::Config("no destination configured".to_string())),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a declaration line into tokens, honoring double quotes
fn tokenize(line: &str) -> Vec<String> {
    let mut toks = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !cur.is_empty() {
                    toks.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        toks.push(cur);
    }
    toks
}

/// Advisory lock file serializing engine instances on one machine
///
/// Created exclusively at engine construction and removed on drop; holding
/// it is a hard precondition for every other operation.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::LockHeld(path.display().to_string())
                } else {
                    Error::Config(format!("Could not create lock file {}: {}", path.display(), e))
                }
            })?;
        let _ = writeln!(file, "{}", std::process::id());
        debug!("Acquired lock file {}", path.display());
        Ok(LockFile {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn write_conf(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("parcel.conf");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_sources_and_dests() {
        let dir = TempDir::new().unwrap();
        let path = write_conf(
            &dir,
            "# comment\n\
             src main http://feeds.example.org/armv7\n\
             src/gz extra http://feeds.example.org/extra armv7\n\
             dest root /\n\
             arch armv7 10\n\
             lists_dir /var/lib/parcel/lists\n\
             option download_retries 5\n",
        );

        let mut conf = Config::new();
        conf.load_file(&path).unwrap();
        conf.finalize();

        assert_eq!(conf.sources.len(), 2);
        assert!(!conf.sources[0].gzip);
        assert!(conf.sources[1].gzip);
        assert_eq!(conf.sources[1].subpath.as_deref(), Some("armv7"));
        assert_eq!(
            conf.sources[1].list_url(),
            "http://feeds.example.org/extra/armv7/Packages.gz"
        );
        assert_eq!(conf.dests.len(), 1);
        assert_eq!(conf.arch_priority("armv7"), Some(10));
        assert_eq!(conf.arch_priority("mips"), None);
        assert_eq!(conf.options.download_retries, 5);
    }

    #[test]
    fn test_duplicate_src_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_conf(
            &dir,
            "src main http://a.example.org\nsrc main http://b.example.org\n",
        );
        let mut conf = Config::new();
        conf.load_file(&path).unwrap();
        assert_eq!(conf.sources.len(), 1);
        assert_eq!(conf.sources[0].url, "http://a.example.org");
    }

    #[test]
    fn test_invalid_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_conf(&dir, "src onlyname\nfrobnicate a b\nsrc ok http://x\n");
        let mut conf = Config::new();
        conf.load_file(&path).unwrap();
        assert_eq!(conf.sources.len(), 1);
        assert_eq!(conf.sources[0].name, "ok");
    }

    #[test]
    fn test_finalize_defaults() {
        let mut conf = Config::new();
        conf.finalize();
        assert!(!conf.dests.is_empty());
        assert_eq!(conf.arch_priority("all"), Some(1));
        assert!(conf.arch_priority(std::env::consts::ARCH).is_some());
    }

    #[test]
    fn test_quoted_tokens() {
        let toks = tokenize("src \"my feed\" http://example.org/feed");
        assert_eq!(toks, vec!["src", "my feed", "http://example.org/feed"]);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");
        let lock = LockFile::acquire(&path).unwrap();
        assert!(matches!(
            LockFile::acquire(&path),
            Err(Error::LockHeld(_))
        ));
        drop(lock);
        // released on drop; can be taken again
        let _lock2 = LockFile::acquire(&path).unwrap();
    }
}
