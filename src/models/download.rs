use crate::error::{LungsegError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zip::ZipArchive;

/// Source of model archives
///
/// Split out so the provisioner can be exercised without a network.
pub trait ArchiveFetcher {
    /// Fetch `url` into `dest`, returning the number of bytes written
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

impl<T: ArchiveFetcher + ?Sized> ArchiveFetcher for &T {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        (**self).fetch(url, dest)
    }
}

impl<T: ArchiveFetcher + ?Sized> ArchiveFetcher for Box<T> {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        (**self).fetch(url, dest)
    }
}

/// Fetches `http(s)://` and `file://` URLs
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    show_progress: bool,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("client", &"Client { ... }")
            .field("show_progress", &self.show_progress)
            .finish()
    }
}

impl HttpFetcher {
    /// Create a fetcher; a zero timeout means none
    pub fn new(timeout_secs: u64, show_progress: bool) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .user_agent(concat!("lungseg/", env!("CARGO_PKG_VERSION")));
        builder = if timeout_secs == 0 {
            builder.timeout(None)
        } else {
            builder.timeout(Duration::from_secs(timeout_secs))
        };
        let client = builder
            .build()
            .map_err(|e| LungsegError::Download(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            show_progress,
        })
    }

    fn progress_bar(&self, total: Option<u64>) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        match total {
            Some(len) => {
                let bar = ProgressBar::new(len);
                if let Ok(style) = ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                ) {
                    bar.set_style(style.progress_chars("#>-"));
                }
                bar
            }
            None => ProgressBar::new_spinner(),
        }
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(local) = url.strip_prefix("file://") {
            tracing::debug!("Copying archive from {local}");
            return fs::copy(local, dest)
                .map_err(|e| LungsegError::Download(format!("Failed to copy {local}: {e}")));
        }

        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| LungsegError::Download(format!("Request to {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| LungsegError::Download(format!("Download of {url} failed: {e}")))?;

        let bar = self.progress_bar(response.content_length());
        let mut file = File::create(dest)?;
        let mut downloaded = 0u64;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|e| LungsegError::Download(format!("Reading {url} failed: {e}")))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])?;
            downloaded += read as u64;
            bar.set_position(downloaded);
        }
        file.flush()?;
        bar.finish_and_clear();

        Ok(downloaded)
    }
}

/// Hex SHA-256 of a file
pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract a zip archive into `dest`, returning the number of files written
///
/// Entries with absolute or `..` paths are skipped.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<usize> {
    let corrupt = |e: zip::result::ZipError| {
        LungsegError::Download(format!(
            "Corrupt model archive {}: {e}",
            archive_path.display()
        ))
    };

    let mut archive = ZipArchive::new(File::open(archive_path)?).map_err(corrupt)?;
    fs::create_dir_all(dest)?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(corrupt)?;
        let Some(relative) = entry.enclosed_name().map(PathBuf::from) else {
            tracing::warn!("Skipping unsafe archive entry: {}", entry.name());
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&target)?;
        io::copy(&mut entry, &mut outfile).map_err(|e| {
            LungsegError::Download(format!(
                "Corrupt model archive {}: {}: {e}",
                archive_path.display(),
                entry.name()
            ))
        })?;
        written += 1;
    }

    if written == 0 {
        return Err(LungsegError::Download(format!(
            "Model archive {} contains no files",
            archive_path.display()
        )));
    }
    Ok(written)
}

/// Check if enough disk space is available
#[cfg(unix)]
pub fn check_disk_space(dir: &Path, required_mb: u64) -> Result<()> {
    let stats = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| LungsegError::Other(format!("Failed to check disk space: {e}")))?;

    #[allow(clippy::unnecessary_cast)]
    let available_bytes = stats.blocks_available() as u64 * stats.fragment_size() as u64;
    // Archive plus its extracted copy
    let required_bytes = required_mb * 2 * 1_024 * 1_024;

    if available_bytes < required_bytes {
        return Err(LungsegError::Configuration(format!(
            "Not enough disk space in {}: {} required, {} available",
            dir.display(),
            format_bytes(required_bytes),
            format_bytes(available_bytes)
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn check_disk_space(_dir: &Path, _required_mb: u64) -> Result<()> {
    Ok(())
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
