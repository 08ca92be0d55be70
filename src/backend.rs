// src/backend.rs

//! Unpack, configure and remove collaborators
//!
//! The transaction engine drives these steps but treats them as opaque: it
//! sequences the calls and inspects success or failure, nothing else.
//! [`IpkBackend`] is the default implementation for ipk archives (an ar
//! archive wrapping `control.tar.gz` and `data.tar.gz`).

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, warn};

use crate::config::Destination;
use crate::error::{Error, Result};
use crate::pkg::Package;

/// Unpack/configure/remove collaborator contract
pub trait Backend {
    /// Unpack the package's downloaded archive into the destination root,
    /// returning the list of installed paths (absolute, root-relative with
    /// a leading `/`)
    fn unpack(&self, pkg: &Package, dest: &Destination) -> Result<Vec<String>>;

    /// Run the package's deferred configuration step
    fn configure(&self, pkg: &Package, dest: &Destination) -> Result<()>;

    /// Remove the package's installed files and maintainer scripts
    fn remove(&self, pkg: &Package, dest: &Destination) -> Result<()>;
}

/// Default backend for ipk/deb-style archives
pub struct IpkBackend;

/// Maintainer scripts preserved from control.tar.gz into the info dir
const MAINTAINER_SCRIPTS: &[&str] = &["preinst", "postinst", "prerm", "postrm"];

impl IpkBackend {
    /// Extract one member (`control.tar.gz` or `data.tar.gz`) from the
    /// outer ar archive
    fn extract_ar_member(archive_path: &Path, member: &str) -> Result<Vec<u8>> {
        let file = File::open(archive_path)?;
        let mut archive = ar::Archive::new(file);

        while let Some(entry) = archive.next_entry() {
            let mut entry = entry.map_err(|e| {
                Error::Internal(format!(
                    "Failed to read ar entry in {}: {}",
                    archive_path.display(),
                    e
                ))
            })?;
            let name = String::from_utf8_lossy(entry.header().identifier()).to_string();
            if name.starts_with(member) {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                return Ok(content);
            }
        }

        Err(Error::Internal(format!(
            "{} not found in {}",
            member,
            archive_path.display()
        )))
    }

    /// Normalize a tar entry path to an absolute install path
    fn entry_install_path(raw: &Path) -> Option<PathBuf> {
        let mut clean = PathBuf::from("/");
        for comp in raw.components() {
            use std::path::Component;
            match comp {
                Component::Normal(c) => clean.push(c),
                Component::ParentDir => return None,
                _ => {}
            }
        }
        if clean == Path::new("/") {
            None
        } else {
            Some(clean)
        }
    }

    /// Unpack data.tar.gz into the destination root, collecting the list of
    /// regular files and symlinks written
    fn unpack_data(archive_path: &Path, root: &Path) -> Result<Vec<String>> {
        let data = Self::extract_ar_member(archive_path, "data.tar.gz")?;
        let mut tar = Archive::new(GzDecoder::new(&data[..]));
        let mut files = Vec::new();

        for entry in tar.entries().map_err(|e| {
            Error::Internal(format!("Failed to read data.tar.gz: {}", e))
        })? {
            let mut entry =
                entry.map_err(|e| Error::Internal(format!("Failed to read tar entry: {}", e)))?;
            let raw = entry
                .path()
                .map_err(|e| Error::Internal(format!("Bad tar entry path: {}", e)))?
                .into_owned();
            let Some(install_path) = Self::entry_install_path(&raw) else {
                continue;
            };

            let target = root.join(install_path.strip_prefix("/").unwrap_or(&install_path));
            if entry.header().entry_type().is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry
                .unpack(&target)
                .map_err(|e| Error::Internal(format!("Failed to unpack {}: {}", raw.display(), e)))?;
            files.push(install_path.to_string_lossy().into_owned());
        }

        Ok(files)
    }

    /// Preserve maintainer scripts from control.tar.gz under the info dir
    fn unpack_control(archive_path: &Path, pkg: &Package, dest: &Destination) -> Result<()> {
        let data = Self::extract_ar_member(archive_path, "control.tar.gz")?;
        let mut tar = Archive::new(GzDecoder::new(&data[..]));
        fs::create_dir_all(&dest.info_dir)?;

        for entry in tar.entries().map_err(|e| {
            Error::Internal(format!("Failed to read control.tar.gz: {}", e))
        })? {
            let mut entry =
                entry.map_err(|e| Error::Internal(format!("Failed to read tar entry: {}", e)))?;
            let raw = entry
                .path()
                .map_err(|e| Error::Internal(format!("Bad tar entry path: {}", e)))?
                .into_owned();
            let Some(name) = raw.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !MAINTAINER_SCRIPTS.contains(&name.as_str()) {
                continue;
            }

            let target = dest.info_dir.join(format!("{}.{}", pkg.name, name));
            entry.unpack(&target).map_err(|e| {
                Error::Internal(format!("Failed to extract {}: {}", name, e))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(0o755));
            }
        }
        Ok(())
    }

    /// Run one maintainer script if present; a missing script is success
    fn run_script(pkg: &Package, dest: &Destination, script: &str) -> Result<()> {
        let path = dest.info_dir.join(format!("{}.{}", pkg.name, script));
        if !path.exists() {
            return Ok(());
        }

        debug!("Running {} script for {}", script, pkg.name);
        let status = Command::new(&path)
            .env("PKG_ROOT", &dest.root_dir)
            .status()
            .map_err(|e| {
                Error::Internal(format!("Failed to run {} for {}: {}", script, pkg.name, e))
            })?;

        if !status.success() {
            return Err(Error::Internal(format!(
                "{} script for {} exited with {}",
                script,
                pkg.name,
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}

impl Backend for IpkBackend {
    fn unpack(&self, pkg: &Package, dest: &Destination) -> Result<Vec<String>> {
        if pkg.local_filename.is_empty() {
            return Err(Error::Internal(format!(
                "Package {} has no downloaded archive",
                pkg.name
            )));
        }
        let archive = Path::new(&pkg.local_filename);

        Self::unpack_control(archive, pkg, dest)?;
        Self::run_script(pkg, dest, "preinst")?;
        let files = Self::unpack_data(archive, &dest.root_dir)?;
        debug!("Unpacked {} files for {}", files.len(), pkg.name);
        Ok(files)
    }

    fn configure(&self, pkg: &Package, dest: &Destination) -> Result<()> {
        Self::run_script(pkg, dest, "postinst")
    }

    fn remove(&self, pkg: &Package, dest: &Destination) -> Result<()> {
        Self::run_script(pkg, dest, "prerm")?;

        // children before parents, so directory entries sort last
        let mut files = pkg.file_list.clone();
        files.sort();
        files.reverse();
        for file in &files {
            let target = dest.root_dir.join(file.trim_start_matches('/'));
            let result = if target.is_dir() {
                fs::remove_dir(&target)
            } else {
                fs::remove_file(&target)
            };
            if let Err(e) = result {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", target.display(), e);
                }
            }
        }

        Self::run_script(pkg, dest, "postrm")?;

        for script in MAINTAINER_SCRIPTS {
            let path = dest.info_dir.join(format!("{}.{}", pkg.name, script));
            if path.exists() {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Destination;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn gz_tar(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn write_ipk(path: &Path, data_entries: &[(&str, &str)]) {
        let control = gz_tar(&[("./control", "Package: test\n")]);
        let data = gz_tar(data_entries);
        let mut builder = ar::Builder::new(File::create(path).unwrap());
        builder
            .append(
                &ar::Header::new(b"debian-binary".to_vec(), 4),
                &b"2.0\n"[..],
            )
            .unwrap();
        builder
            .append(
                &ar::Header::new(b"control.tar.gz".to_vec(), control.len() as u64),
                &control[..],
            )
            .unwrap();
        builder
            .append(
                &ar::Header::new(b"data.tar.gz".to_vec(), data.len() as u64),
                &data[..],
            )
            .unwrap();
    }

    fn test_dest(dir: &TempDir) -> Destination {
        Destination::new("root", dir.path().join("root"), &dir.path().join("lists"))
    }

    #[test]
    fn test_unpack_writes_files_and_reports_list() {
        let dir = TempDir::new().unwrap();
        let dest = test_dest(&dir);
        let ipk = dir.path().join("test_1.0_armv7.ipk");
        write_ipk(
            &ipk,
            &[
                ("./usr/bin/hello", "#!/bin/sh\necho hello\n"),
                ("./etc/hello.conf", "greeting=hello\n"),
            ],
        );

        let mut pkg = Package::new("test");
        pkg.local_filename = ipk.to_string_lossy().into_owned();

        let files = IpkBackend.unpack(&pkg, &dest).unwrap();
        assert_eq!(files, vec!["/usr/bin/hello", "/etc/hello.conf"]);
        assert!(dest.root_dir.join("usr/bin/hello").exists());
        assert!(dest.root_dir.join("etc/hello.conf").exists());
    }

    #[test]
    fn test_unpack_missing_archive_fails() {
        let dir = TempDir::new().unwrap();
        let dest = test_dest(&dir);
        let pkg = Package::new("ghost");
        assert!(IpkBackend.unpack(&pkg, &dest).is_err());
    }

    #[test]
    fn test_remove_deletes_recorded_files() {
        let dir = TempDir::new().unwrap();
        let dest = test_dest(&dir);
        let ipk = dir.path().join("test_1.0_armv7.ipk");
        write_ipk(&ipk, &[("./usr/bin/hello", "hi\n")]);

        let mut pkg = Package::new("test");
        pkg.local_filename = ipk.to_string_lossy().into_owned();
        pkg.file_list = IpkBackend.unpack(&pkg, &dest).unwrap();

        IpkBackend.remove(&pkg, &dest).unwrap();
        assert!(!dest.root_dir.join("usr/bin/hello").exists());
    }

    #[test]
    fn test_configure_without_script_succeeds() {
        let dir = TempDir::new().unwrap();
        let dest = test_dest(&dir);
        let pkg = Package::new("plain");
        IpkBackend.configure(&pkg, &dest).unwrap();
    }

    #[test]
    fn test_entry_path_normalization() {
        assert_eq!(
            IpkBackend::entry_install_path(Path::new("./usr/bin/x")),
            Some(PathBuf::from("/usr/bin/x"))
        );
        assert_eq!(IpkBackend::entry_install_path(Path::new("./")), None);
        assert_eq!(IpkBackend::entry_install_path(Path::new("../evil")), None);
    }
}
