//! Artifact (de)compression.
//!
//! A rule's artifact blob is a ZIP archive whose members mirror the declared
//! output paths relative to the project root. Packing and unpacking run on
//! the blocking pool; the async entry points just ship the work there.
//!
//! Manifests travel to the artifact cache GZIP-compressed; the byte-level
//! helpers for that live here too.

use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::warn;
use zip::write::SimpleFileOptions;

use kiln_hash::ProjectFilesystem;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("non-UTF8 path in archive")]
    NonUtf8Path,

    #[error("declared output `{path}` missing after build")]
    MissingOutput { path: Utf8PathBuf },

    #[error("spawn_blocking failed: {0}")]
    SpawnBlocking(#[from] tokio::task::JoinError),
}

fn io_err(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_owned(),
        source,
    }
}

/// What packing produced; the engine checks the uncompressed total against
/// the configured upload size limit.
#[derive(Debug, Clone, Copy)]
pub struct PackStats {
    pub entries: usize,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
}

/// How unpacking treats existing files at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingFileMode {
    /// Overwrite colliding files, leave other siblings alone.
    Overwrite,
    /// Remove each declared output path first so stale siblings inside
    /// output directories cannot survive the unpack.
    OverwriteAndCleanDirectories,
}

/// Zip the declared output paths (files or whole directories) into
/// `out_zip`, member names project-relative.
pub async fn pack(
    fs: ProjectFilesystem,
    paths: Vec<Utf8PathBuf>,
    out_zip: Utf8PathBuf,
) -> Result<PackStats, ArchiveError> {
    tokio::task::spawn_blocking(move || pack_sync(&fs, &paths, &out_zip)).await?
}

/// Extract an artifact blob into the project filesystem.
pub async fn unpack(
    zip_path: Utf8PathBuf,
    fs: ProjectFilesystem,
    declared_outputs: Vec<Utf8PathBuf>,
    mode: ExistingFileMode,
) -> Result<(), ArchiveError> {
    tokio::task::spawn_blocking(move || unpack_sync(&zip_path, &fs, &declared_outputs, mode))
        .await?
}

fn pack_sync(
    fs: &ProjectFilesystem,
    paths: &[Utf8PathBuf],
    out_zip: &Utf8Path,
) -> Result<PackStats, ArchiveError> {
    if let Some(parent) = out_zip.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let file = std::fs::File::create(out_zip).map_err(io_err(out_zip))?;
    let mut writer = zip::ZipWriter::new(file);

    let mut entries = 0usize;
    let mut uncompressed = 0u64;
    for rel in paths {
        let abs = fs.resolve(rel);
        if !abs.exists() {
            return Err(ArchiveError::MissingOutput { path: rel.clone() });
        }
        if abs.is_dir() {
            pack_dir(fs, rel, &mut writer, &mut entries, &mut uncompressed)?;
        } else {
            pack_file(fs, rel, &mut writer, &mut entries, &mut uncompressed)?;
        }
    }

    let file = writer.finish()?;
    let compressed = file.metadata().map(|m| m.len()).unwrap_or(0);

    Ok(PackStats {
        entries,
        uncompressed_bytes: uncompressed,
        compressed_bytes: compressed,
    })
}

fn pack_dir(
    fs: &ProjectFilesystem,
    rel: &Utf8Path,
    writer: &mut zip::ZipWriter<std::fs::File>,
    entries: &mut usize,
    uncompressed: &mut u64,
) -> Result<(), ArchiveError> {
    let abs = fs.resolve(rel);
    let mut children: Vec<_> = std::fs::read_dir(&abs)
        .map_err(io_err(&abs))?
        .collect::<Result<_, _>>()
        .map_err(io_err(&abs))?;
    // Stable member order keeps packed blobs byte-comparable across runs.
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let name = child
            .file_name()
            .into_string()
            .map_err(|_| ArchiveError::NonUtf8Path)?;
        let child_rel = rel.join(&name);
        if child.path().is_dir() {
            pack_dir(fs, &child_rel, writer, entries, uncompressed)?;
        } else {
            pack_file(fs, &child_rel, writer, entries, uncompressed)?;
        }
    }
    Ok(())
}

fn pack_file(
    fs: &ProjectFilesystem,
    rel: &Utf8Path,
    writer: &mut zip::ZipWriter<std::fs::File>,
    entries: &mut usize,
    uncompressed: &mut u64,
) -> Result<(), ArchiveError> {
    let abs = fs.resolve(rel);

    let mut options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&abs).map_err(io_err(&abs))?.permissions().mode();
        options = options.unix_permissions(mode);
    }

    writer.start_file(rel.as_str(), options)?;
    let mut file = std::fs::File::open(&abs).map_err(io_err(&abs))?;
    let written = std::io::copy(&mut file, writer).map_err(io_err(&abs))?;

    *entries += 1;
    *uncompressed += written;
    Ok(())
}

fn unpack_sync(
    zip_path: &Utf8Path,
    fs: &ProjectFilesystem,
    declared_outputs: &[Utf8PathBuf],
    mode: ExistingFileMode,
) -> Result<(), ArchiveError> {
    if mode == ExistingFileMode::OverwriteAndCleanDirectories {
        for rel in declared_outputs {
            let abs = fs.resolve(rel);
            kiln_io::remove_path_if_exists(&abs).map_err(io_err(&abs))?;
        }
    }

    let file = std::fs::File::open(zip_path).map_err(io_err(zip_path))?;
    let mut archive = zip::ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        // enclosed_name rejects traversal and absolute members.
        let Some(rel) = entry.enclosed_name() else {
            warn!(member = entry.name(), "skipping unsafe archive member");
            continue;
        };
        let rel = Utf8PathBuf::from_path_buf(rel).map_err(|_| ArchiveError::NonUtf8Path)?;
        let dest = fs.resolve(&rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&dest).map_err(io_err(&dest))?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut out = std::fs::File::create(&dest).map_err(io_err(&dest))?;
        std::io::copy(&mut entry, &mut out).map_err(io_err(&dest))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))
                .map_err(io_err(&dest))?;
        }
    }

    Ok(())
}

/// GZIP-compress a byte buffer (manifest wire form).
pub fn gzip_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress a GZIP byte buffer.
pub fn gunzip_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
