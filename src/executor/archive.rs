//! Host-side staging for transfers: scratch directories, tar archives and
//! the final rename into place.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tempfile::TempDir;

use crate::backend::TransferKind;

const PAYLOAD: &str = "payload";
const ARCHIVE: &str = "archive.tar";
const TREE: &str = "tree";

/// Scratch directory removed when dropped.
pub(super) struct Scratch {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Scratch {
    /// Creates scratch space in the system temporary directory.
    fn new() -> Result<Self, String> {
        let dir = tempfile::Builder::new()
            .prefix("kiln-")
            .tempdir()
            .map_err(|err| format!("failed to create scratch directory: {err}"))?;
        Self::wrap(dir)
    }

    /// Creates scratch space next to `target`, so a later rename stays on
    /// one filesystem.
    pub(super) fn beside(target: &Utf8Path) -> Result<Self, String> {
        let parent = host_parent(target);
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| format!("failed to create {parent}: {err}"))?;
        let dir = tempfile::Builder::new()
            .prefix(".kiln-")
            .tempdir_in(parent)
            .map_err(|err| format!("failed to create scratch directory in {parent}: {err}"))?;
        Self::wrap(dir)
    }

    fn wrap(dir: TempDir) -> Result<Self, String> {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|path| format!("scratch path {} is not UTF-8", path.display()))?;
        Ok(Self { _dir: dir, root })
    }

    /// Location of the single staged file.
    pub(super) fn payload(&self) -> Utf8PathBuf {
        self.root.join(PAYLOAD)
    }

    /// Location of the staged archive.
    pub(super) fn archive(&self) -> Utf8PathBuf {
        self.root.join(ARCHIVE)
    }

    /// Location of the unpacked tree.
    pub(super) fn tree(&self) -> Utf8PathBuf {
        self.root.join(TREE)
    }

    fn open(&self) -> Result<Dir, String> {
        Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| format!("failed to open scratch directory: {err}"))
    }
}

/// Writes `content` into a fresh scratch directory.
pub(super) fn stage_bytes(content: &[u8]) -> Result<Scratch, String> {
    let scratch = Scratch::new()?;
    scratch
        .open()?
        .write(PAYLOAD, content)
        .map_err(|err| format!("failed to stage file content: {err}"))?;
    Ok(scratch)
}

/// Packs the directory `source` into an archive inside fresh scratch space.
pub(super) async fn pack_directory(source: Utf8PathBuf) -> Result<Scratch, String> {
    tokio::task::spawn_blocking(move || {
        let scratch = Scratch::new()?;
        let file = scratch
            .open()?
            .create(ARCHIVE)
            .map_err(|err| format!("failed to create archive: {err}"))?;
        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", &source)
            .and_then(|()| builder.finish())
            .map_err(|err| format!("failed to archive {source}: {err}"))?;
        Ok(scratch)
    })
    .await
    .map_err(|err| format!("archive task failed: {err}"))?
}

/// Unpacks the archive at `archive` into the directory `tree`.
pub(super) async fn unpack_archive(archive: Utf8PathBuf, tree: Utf8PathBuf) -> Result<(), String> {
    tokio::task::spawn_blocking(move || {
        Dir::create_ambient_dir_all(&tree, ambient_authority())
            .map_err(|err| format!("failed to create {tree}: {err}"))?;
        let parent = host_parent(&archive);
        let name = archive
            .file_name()
            .ok_or_else(|| format!("{archive} has no file name"))?;
        let file = Dir::open_ambient_dir(parent, ambient_authority())
            .and_then(|dir| dir.open(name))
            .map_err(|err| format!("failed to open archive: {err}"))?;
        tar::Archive::new(file)
            .unpack(&tree)
            .map_err(|err| format!("failed to unpack archive: {err}"))
    })
    .await
    .map_err(|err| format!("unpack task failed: {err}"))?
}

/// Replaces `target` with `staged`, which must live beside it.
pub(super) fn replace(staged: &Utf8Path, target: &Utf8Path) -> Result<(), String> {
    let parent = host_parent(target);
    let name = target
        .file_name()
        .ok_or_else(|| format!("{target} has no file name"))?;
    let staged_rel = staged
        .strip_prefix(parent)
        .map_err(|_| format!("{staged} is not inside {parent}"))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| format!("failed to open {parent}: {err}"))?;
    match dir.symlink_metadata(name) {
        Ok(meta) if meta.is_dir() => dir.remove_dir_all(name),
        Ok(_) => dir.remove_file(name),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
    .map_err(|err| format!("failed to replace {target}: {err}"))?;
    dir.rename(staged_rel, &dir, name)
        .map_err(|err| format!("failed to move staged copy to {target}: {err}"))
}

/// Classifies a host path for a push.
pub(super) fn host_kind(path: &Utf8Path) -> Result<TransferKind, String> {
    let Some(name) = path.file_name() else {
        return Dir::open_ambient_dir(path, ambient_authority())
            .map(|_| TransferKind::Directory)
            .map_err(|err| format!("cannot read {path}: {err}"));
    };
    let meta = Dir::open_ambient_dir(host_parent(path), ambient_authority())
        .and_then(|dir| dir.metadata(name))
        .map_err(|err| format!("cannot read {path}: {err}"))?;
    if meta.is_dir() {
        Ok(TransferKind::Directory)
    } else if meta.is_file() {
        Ok(TransferKind::File)
    } else {
        Err(format!("{path} is neither a file nor a directory"))
    }
}

fn host_parent(path: &Utf8Path) -> &Utf8Path {
    path.parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."))
}
