// src/fetch.rs

//! Download collaborators
//!
//! The engine drives downloads through the [`Fetcher`] trait and only
//! inspects success or failure; [`HttpFetcher`] is the default
//! implementation with timeout, bounded retries and atomic
//! download-to-temp-then-rename. Detached-signature verification goes
//! through the [`Verifier`] trait so embedders can plug in their own
//! crypto; the default reports verification as unsupported.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 1000;

/// Per-download fractional progress callback, 0-100
pub type FetchProgress<'a> = &'a mut dyn FnMut(u8);

/// Transport collaborator invoked by the engine for every remote file
pub trait Fetcher {
    /// Download `url` to `dest`, reporting fractional progress when a
    /// callback is supplied
    fn fetch(&self, url: &str, dest: &Path, progress: Option<FetchProgress>) -> Result<()>;
}

/// Blocking HTTP fetcher with retry support
pub struct HttpFetcher {
    client: Client,
    max_retries: u32,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64, max_retries: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_retries,
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path, mut progress: Option<FetchProgress>) -> Result<()> {
        info!("Downloading {} to {}", url, dest.display());

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadFailed(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    let total = response.content_length().unwrap_or(0);

                    // write to a temporary file first, rename into place
                    let temp_path = dest.with_extension("tmp");
                    let mut file = File::create(&temp_path)?;

                    let mut buf = [0u8; 8192];
                    let mut done: u64 = 0;
                    let mut prev_pct = u8::MAX;
                    loop {
                        let n = response.read(&mut buf).map_err(|e| {
                            Error::DownloadFailed(format!("Failed to read response body: {}", e))
                        })?;
                        if n == 0 {
                            break;
                        }
                        io::Write::write_all(&mut file, &buf[..n])?;
                        done += n as u64;
                        if total > 0 {
                            if let Some(cb) = progress.as_mut() {
                                let pct = (done * 100 / total).min(100) as u8;
                                // skip repeats caused by rounding
                                if pct != prev_pct {
                                    prev_pct = pct;
                                    cb(pct);
                                }
                            }
                        }
                    }

                    fs::rename(&temp_path, dest)?;
                    debug!("Successfully downloaded to {}", dest.display());
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadFailed(format!(
                            "Failed to download {} after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

/// Detached-signature verification collaborator
pub trait Verifier {
    /// Verify `file` against the detached signature at `sig`
    fn verify(&self, file: &Path, sig: &Path) -> Result<()>;
}

/// Default verifier: signature checking was not enabled in this build
pub struct UnsupportedVerifier;

impl Verifier for UnsupportedVerifier {
    fn verify(&self, file: &Path, _sig: &Path) -> Result<()> {
        Err(Error::Config(format!(
            "No signature verifier configured, cannot check {}",
            file.display()
        )))
    }
}

/// Inflate a gzip-compressed file into `dest`
pub fn gunzip_file(src: &Path, dest: &Path) -> Result<()> {
    let file = File::open(src)?;
    let mut decoder = GzDecoder::new(file);
    let mut content = Vec::new();
    decoder.read_to_end(&mut content).map_err(|e| {
        Error::Parse(format!("Failed to decompress {}: {}", src.display(), e))
    })?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, content)?;
    Ok(())
}

/// Verify a downloaded file against its published SHA-256 checksum
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    use sha2::{Digest, Sha256};

    debug!("Verifying checksum for {}", path.display());

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    let actual = format!("{:x}", hasher.finalize());

    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_gunzip_roundtrip() {
        let dir = TempDir::new().unwrap();
        let gz_path = dir.path().join("Packages.gz");
        let out_path = dir.path().join("Packages");

        let payload = "Package: a\nVersion: 1.0\n";
        let file = File::create(&gz_path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(payload.as_bytes()).unwrap();
        encoder.finish().unwrap();

        gunzip_file(&gz_path, &out_path).unwrap();
        assert_eq!(fs::read_to_string(&out_path).unwrap(), payload);
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let gz_path = dir.path().join("Packages.gz");
        fs::write(&gz_path, b"this is not gzip").unwrap();
        assert!(gunzip_file(&gz_path, &dir.path().join("out")).is_err());
    }

    #[test]
    fn test_sha256_verification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pkg.ipk");
        fs::write(&path, b"hello").unwrap();

        // sha256("hello")
        let good = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        verify_sha256(&path, good).unwrap();
        verify_sha256(&path, &good.to_uppercase()).unwrap();

        let err = verify_sha256(&path, "deadbeef").unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_unsupported_verifier_errors() {
        let dir = TempDir::new().unwrap();
        let v = UnsupportedVerifier;
        assert!(v
            .verify(&dir.path().join("a"), &dir.path().join("a.sig"))
            .is_err());
    }
}
