//! Streaming tarball extraction.
//!
//! Unpacks a gzipped tar stream into a destination directory. Registry
//! tarballs place all entries under a top-level `package/` directory, which
//! is stripped. Only directories and regular files are materialized; symlinks,
//! hardlinks, devices, FIFOs, and sockets are silently ignored.

use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tar::{Archive, EntryType};
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Extraction failure kinds. Localized to one package; the pipeline logs and
/// continues with sibling installs.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("gzip stream error: {0}")]
    Gzip(#[source] io::Error),

    #[error("tar stream error: {0}")]
    Tar(#[source] io::Error),

    #[error("mkdir {path} failed: {source}")]
    Mkdir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("create {path} failed: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Directory-creation dedup shared across concurrent extractions.
///
/// Packages overwhelmingly share parents (`node_modules/<name>/lib`, scope
/// directories), so remembering what already exists avoids repeated mkdir
/// syscalls from every extract worker.
#[derive(Debug, Default)]
pub struct DirSet {
    created: RwLock<HashSet<PathBuf>>,
}

impl DirSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure `path` exists as a directory, creating missing parents.
    pub fn ensure(&self, path: &Path) -> Result<(), ExtractError> {
        {
            let created = self.created.read().unwrap_or_else(PoisonError::into_inner);
            if created.contains(path) {
                return Ok(());
            }
        }

        fs::create_dir_all(path).map_err(|source| ExtractError::Mkdir {
            path: path.to_path_buf(),
            source,
        })?;

        let mut created = self.created.write().unwrap_or_else(PoisonError::into_inner);
        created.insert(path.to_path_buf());
        Ok(())
    }
}

/// Unpack a gzipped tar stream beneath `dest`.
///
/// Reads tar headers sequentially, strips the `package/` prefix from entry
/// names, and streams file bytes straight to disk. Stops cleanly at
/// end-of-stream.
pub fn extract<R: Read>(reader: R, dest: &Path, dirs: &DirSet) -> Result<(), ExtractError> {
    let mut archive = Archive::new(gzip_reader(reader)?);

    for entry in archive.entries().map_err(ExtractError::Tar)? {
        let mut entry = entry.map_err(ExtractError::Tar)?;

        let header_path = entry.path().map_err(ExtractError::Tar)?.into_owned();
        let relative = header_path
            .strip_prefix("package")
            .unwrap_or(&header_path)
            .to_path_buf();
        let target = dest.join(relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                dirs.ensure(&target)?;
                set_mode(&target, entry.header().mode().ok());
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    dirs.ensure(parent)?;
                }

                let mut file = File::create(&target).map_err(|source| ExtractError::Create {
                    path: target.clone(),
                    source,
                })?;
                io::copy(&mut entry, &mut file).map_err(|source| ExtractError::Write {
                    path: target.clone(),
                    source,
                })?;

                set_mode(&target, entry.header().mode().ok());
            }
            // Symlinks, hardlinks, devices, FIFOs, sockets: ignored.
            _ => {}
        }
    }

    Ok(())
}

/// Validate the gzip magic up front, then hand the stream to the decoder.
/// A truncated or non-gzip body fails here instead of surfacing as a
/// confusing tar error mid-archive.
fn gzip_reader<R: Read>(mut reader: R) -> Result<GzDecoder<impl Read>, ExtractError> {
    let mut magic = [0u8; 2];
    reader.read_exact(&mut magic).map_err(ExtractError::Gzip)?;

    if magic != GZIP_MAGIC {
        return Err(ExtractError::Gzip(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a gzip stream",
        )));
    }

    Ok(GzDecoder::new(io::Cursor::new(magic).chain(reader)))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode.filter(|m| *m != 0) {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;
    use tar::{Builder, Header};
    use tempfile::tempdir;

    fn add_file(builder: &mut Builder<&mut Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    fn gzip(tar_bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn package_tarball() -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            add_file(
                &mut builder,
                "package/package.json",
                br#"{"name":"demo","version":"1.0.0"}"#,
            );
            add_file(&mut builder, "package/lib/index.js", b"module.exports = 42;");
            builder.finish().unwrap();
        }
        gzip(&tar_bytes)
    }

    #[test]
    fn test_extract_strips_package_prefix() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("node_modules/demo");
        let dirs = DirSet::new();

        extract(&package_tarball()[..], &dest, &dirs).unwrap();

        assert!(dest.join("package.json").exists());
        assert!(dest.join("lib/index.js").exists());

        let pkg_json = fs::read_to_string(dest.join("package.json")).unwrap();
        assert!(pkg_json.contains("demo"));
    }

    #[test]
    fn test_extract_ignores_special_entries() {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            add_file(&mut builder, "package/real.txt", b"data");

            let mut header = Header::new_gnu();
            header.set_path("package/link").unwrap();
            header.set_entry_type(EntryType::Symlink);
            header.set_link_name("real.txt").unwrap();
            header.set_size(0);
            header.set_cksum();
            builder.append(&header, &[][..]).unwrap();

            builder.finish().unwrap();
        }

        let dir = tempdir().unwrap();
        let dest = dir.path().join("pkg");
        let dirs = DirSet::new();

        extract(&gzip(&tar_bytes)[..], &dest, &dirs).unwrap();

        assert!(dest.join("real.txt").exists());
        assert!(!dest.join("link").exists());
    }

    #[test]
    fn test_extract_rejects_non_gzip_stream() {
        let dir = tempdir().unwrap();
        let dirs = DirSet::new();

        let err = extract(&b"plainly not gzip"[..], dir.path(), &dirs).unwrap_err();
        assert!(matches!(err, ExtractError::Gzip(_)));
    }

    #[test]
    fn test_extract_rejects_truncated_stream() {
        let dir = tempdir().unwrap();
        let dirs = DirSet::new();

        let mut bytes = package_tarball();
        bytes.truncate(bytes.len() / 2);

        let err = extract(&bytes[..], dir.path(), &dirs).unwrap_err();
        assert!(matches!(err, ExtractError::Tar(_) | ExtractError::Write { .. }));
    }

    #[test]
    fn test_dirset_dedups_creation() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        let dirs = DirSet::new();

        dirs.ensure(&target).unwrap();
        assert!(target.is_dir());

        // Second call is answered from the set even if the directory is gone.
        fs::remove_dir(&target).unwrap();
        dirs.ensure(&target).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_extract_same_package_twice_overwrites() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("demo");
        let dirs = DirSet::new();

        extract(&package_tarball()[..], &dest, &dirs).unwrap();
        extract(&package_tarball()[..], &dest, &dirs).unwrap();

        assert!(dest.join("package.json").exists());
    }
}
