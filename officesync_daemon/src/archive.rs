//! Blocking archive primitives used by the backup manager. Everything here
//! runs on the blocking pool.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::BackupError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub skipped: usize,
}

/// Entry name for `path` relative to `root`, always `/`-separated.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>, skipped: &mut usize) {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("skipping {}: {e}", path.display());
            *skipped += 1;
            return;
        }
    };
    if meta.is_file() {
        out.push(path.to_path_buf());
        return;
    }
    if !meta.is_dir() {
        debug!("skipping non-regular file {}", path.display());
        return;
    }
    let entries = match fs::read_dir(path) {
        Ok(rd) => rd,
        Err(e) => {
            warn!("skipping unreadable directory {}: {e}", path.display());
            *skipped += 1;
            return;
        }
    };
    let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    children.sort();
    for child in children {
        collect_files(&child, out, skipped);
    }
}

/// Write every file under `sources` into a deflated zip at `dest`, naming
/// entries relative to `root`. Missing sources are ignored; unreadable files
/// are logged and left out.
pub fn write_archive(dest: &Path, root: &Path, sources: &[PathBuf]) -> Result<ArchiveSummary, BackupError> {
    let mut summary = ArchiveSummary::default();
    let mut files = Vec::new();
    for src in sources {
        collect_files(src, &mut files, &mut summary.skipped);
    }

    let out = File::create(dest).map_err(|e| BackupError::io(dest, e))?;
    let mut zip = ZipWriter::new(BufWriter::new(out));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for file in files {
        let Some(name) = entry_name(root, &file) else {
            continue;
        };
        let mut input = match File::open(&file) {
            Ok(f) => BufReader::new(f),
            Err(e) => {
                warn!("skipping unreadable file {}: {e}", file.display());
                summary.skipped += 1;
                continue;
            }
        };
        zip.start_file(name, options)?;
        if let Err(e) = io::copy(&mut input, &mut zip) {
            // The entry stays in the archive truncated; the archive is still
            // well formed and the gap is logged.
            warn!("short read on {}: {e}", file.display());
            summary.skipped += 1;
            continue;
        }
        summary.files += 1;
    }

    let mut inner = zip.finish()?;
    io::Write::flush(&mut inner).map_err(|e| BackupError::io(dest, e))?;
    inner
        .into_inner()
        .map_err(|e| BackupError::io(dest, e.into_error()))?
        .sync_all()
        .map_err(|e| BackupError::io(dest, e))?;
    Ok(summary)
}

/// Hex SHA-256 of a file's bytes.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract `archive` beneath `dest`. Entries that would escape `dest` are
/// rejected.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize, BackupError> {
    let file = File::open(archive).map_err(|e| BackupError::io(archive, e))?;
    let mut zip = ZipArchive::new(BufReader::new(file))?;
    let mut written = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            warn!("refusing unsafe archive entry {:?}", entry.name());
            continue;
        };
        let out_path = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| BackupError::io(&out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
        }
        let mut out = File::create(&out_path).map_err(|e| BackupError::io(&out_path, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| BackupError::io(&out_path, e))?;
        written += 1;
    }
    Ok(written)
}

pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
    }
    Ok(())
}

fn files_under(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            files_under(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

/// Rename, or copy then delete when the rename crosses filesystems.
fn relocate(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Move every file under `src` to the same relative place under `dst`.
///
/// Files being replaced are parked under `aside` first. If any step fails,
/// the files already moved are taken out again and the parked ones put
/// back, so `dst` ends up as it started. `aside` is removed once it is empty
/// of anything worth keeping; if the rollback itself fails it stays for an
/// operator. Returns the number of files moved.
pub fn move_tree(src: &Path, dst: &Path, aside: &Path) -> io::Result<usize> {
    let mut files = Vec::new();
    files_under(src, src, &mut files)?;
    files.sort();

    let mut placed: Vec<&PathBuf> = Vec::new();
    let mut parked: Vec<&PathBuf> = Vec::new();
    let moved = files.iter().try_for_each(|rel| {
        let to = dst.join(rel);
        if to.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("directory in the way at {}", to.display()),
            ));
        }
        if to.exists() {
            relocate(&to, &aside.join(rel))?;
            parked.push(rel);
        }
        relocate(&src.join(rel), &to)?;
        placed.push(rel);
        Ok(())
    });

    let Err(e) = moved else {
        let _ = fs::remove_dir_all(aside);
        return Ok(files.len());
    };

    warn!(
        "moving into {} failed after {} of {} file(s): {e}; rolling back",
        dst.display(),
        placed.len(),
        files.len()
    );
    let mut clean = true;
    for rel in placed.iter().rev() {
        if let Err(rm) = fs::remove_file(dst.join(rel)) {
            error!("cannot take back {}: {rm}", dst.join(rel).display());
            clean = false;
        }
    }
    for rel in parked.iter().rev() {
        if let Err(back) = relocate(&aside.join(rel), &dst.join(rel)) {
            error!(
                "cannot return {} from {}: {back}",
                rel.display(),
                aside.display()
            );
            clean = false;
        }
    }
    if clean {
        let _ = fs::remove_dir_all(aside);
    }
    Err(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_extract_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        fs::create_dir_all(root.join("mc/agents/scout")).unwrap();
        fs::write(root.join("mc/agents/scout/state.json"), b"{\"status\":\"idle\"}").unwrap();
        fs::write(root.join("mc/TASK_QUEUE.md"), b"- [ ] x\n").unwrap();

        let zip_path = dir.path().join("a.zip");
        let summary = write_archive(
            &zip_path,
            &root,
            &[root.join("mc/agents"), root.join("mc/TASK_QUEUE.md"), root.join("mc/missing")],
        )
        .unwrap();
        assert_eq!(summary, ArchiveSummary { files: 2, skipped: 0 });

        let digest = sha256_file(&zip_path).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, sha256_file(&zip_path).unwrap());

        let out = dir.path().join("out");
        assert_eq!(extract_archive(&zip_path, &out).unwrap(), 2);
        assert_eq!(
            fs::read(out.join("mc/agents/scout/state.json")).unwrap(),
            b"{\"status\":\"idle\"}"
        );
    }

    #[test]
    fn move_tree_replaces_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let aside = dir.path().join("aside");
        fs::create_dir_all(src.join("a")).unwrap();
        fs::create_dir_all(dst.join("a")).unwrap();
        fs::write(src.join("a/f"), b"new").unwrap();
        fs::write(dst.join("a/f"), b"old").unwrap();
        fs::write(dst.join("keep"), b"k").unwrap();

        assert_eq!(move_tree(&src, &dst, &aside).unwrap(), 1);
        assert_eq!(fs::read(dst.join("a/f")).unwrap(), b"new");
        assert_eq!(fs::read(dst.join("keep")).unwrap(), b"k");
        assert!(!aside.exists());
    }

    #[test]
    fn move_tree_failure_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let aside = dir.path().join("aside");
        fs::create_dir_all(src.join("a")).unwrap();
        fs::create_dir_all(src.join("b")).unwrap();
        fs::write(src.join("a/f"), b"new").unwrap();
        fs::write(src.join("a/g"), b"added").unwrap();
        fs::write(src.join("b/h"), b"new").unwrap();

        fs::create_dir_all(dst.join("a")).unwrap();
        fs::write(dst.join("a/f"), b"old").unwrap();
        // "b/h" is a directory in the target, so the third file cannot land
        fs::create_dir_all(dst.join("b/h")).unwrap();
        fs::write(dst.join("b/h/inner"), b"x").unwrap();

        assert!(move_tree(&src, &dst, &aside).is_err());
        assert_eq!(fs::read(dst.join("a/f")).unwrap(), b"old");
        assert!(!dst.join("a/g").exists());
        assert_eq!(fs::read(dst.join("b/h/inner")).unwrap(), b"x");
        assert!(!aside.exists());
    }
}
