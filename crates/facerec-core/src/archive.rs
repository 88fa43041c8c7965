//! Hierarchical binary container for trained machines, features and models.
//!
//! An archive is a tree of named groups holding named datasets (scalars,
//! strings and n-dimensional `f64` arrays). Paths follow the usual
//! `/group/subgroup/dataset` convention; relative paths are resolved
//! against the current group set with [`Archive::cd`].
//!
//! On disk an archive is an 8-byte magic, the SHA-256 digest of the body,
//! then the MessagePack-encoded body. Files are written to a temporary
//! sibling and renamed into place, so readers never observe a partial file.

use ndarray::{Array, Array1, Array2, ArrayBase, ArrayD, Data, Dimension, IxDyn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

const ARCHIVE_MAGIC: &[u8; 8] = b"FRARCHV1";
const DIGEST_LEN: usize = 32;

/// Dataset name used when a bare array is stored as an artifact.
const ARRAY_DATASET: &str = "array";

static TMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not a facerec archive")]
    BadMagic(PathBuf),
    #[error("archive {0} is corrupted (digest mismatch)")]
    Corrupted(PathBuf),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("missing entry: {0}")]
    Missing(String),
    #[error("entry {path} is a {found}, expected {expected}")]
    WrongKind {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("entry {path} has shape {found:?}, expected {expected}")]
    Shape {
        path: String,
        expected: String,
        found: Vec<usize>,
    },
    #[error("entry {path} is invalid: {reason}")]
    InvalidValue { path: String, reason: String },
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// A leaf value stored in an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Dataset {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Row-major array data with its shape.
    Array { shape: Vec<usize>, data: Vec<f64> },
}

impl Dataset {
    pub fn kind(&self) -> &'static str {
        match self {
            Dataset::Bool(_) => "bool",
            Dataset::Int(_) => "integer",
            Dataset::Float(_) => "float",
            Dataset::Text(_) => "string",
            Dataset::Array { .. } => "array",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Bool(v) => write!(f, "{v}"),
            Dataset::Int(v) => write!(f, "{v}"),
            Dataset::Float(v) => write!(f, "{v}"),
            Dataset::Text(v) => write!(f, "{v:?}"),
            Dataset::Array { shape, .. } => write!(f, "array{shape:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Group(Group),
    Dataset(Dataset),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Group {
    entries: BTreeMap<String, Node>,
}

/// First difference found by [`Archive::compare`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveMismatch {
    pub path: String,
    pub reason: String,
}

impl fmt::Display for ArchiveMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

impl std::error::Error for ArchiveMismatch {}

/// In-memory archive tree with a current working group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Archive {
    root: Group,
    cwd: Vec<String>,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and verify an archive file.
    pub fn read(path: &Path) -> Result<Self, ArchiveError> {
        let bytes = std::fs::read(path).map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let header = ARCHIVE_MAGIC.len() + DIGEST_LEN;
        if bytes.len() < header || &bytes[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
            return Err(ArchiveError::BadMagic(path.to_path_buf()));
        }

        let (digest, body) = bytes[ARCHIVE_MAGIC.len()..].split_at(DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(ArchiveError::Corrupted(path.to_path_buf()));
        }

        let root: Group =
            rmp_serde::from_slice(body).map_err(|e| ArchiveError::Decode(e.to_string()))?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "archive read");
        Ok(Self {
            root,
            cwd: Vec::new(),
        })
    }

    /// Write the archive, replacing `path` atomically once fully synced.
    pub fn write(&self, path: &Path) -> Result<(), ArchiveError> {
        let body =
            rmp_serde::to_vec_named(&self.root).map_err(|e| ArchiveError::Encode(e.to_string()))?;
        let digest = Sha256::digest(&body);

        let mut bytes = Vec::with_capacity(ARCHIVE_MAGIC.len() + DIGEST_LEN + body.len());
        bytes.extend_from_slice(ARCHIVE_MAGIC);
        bytes.extend_from_slice(&digest);
        bytes.extend_from_slice(&body);

        let io_err = |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp = temporary_sibling(path);
        if let Err(e) = write_synced(&tmp, &bytes) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        std::fs::rename(&tmp, path).map_err(io_err)?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "archive written");
        Ok(())
    }

    /// Current group as an absolute path.
    pub fn pwd(&self) -> String {
        format!("/{}", self.cwd.join("/"))
    }

    /// Change the current group. The group must exist.
    pub fn cd(&mut self, path: &str) -> Result<(), ArchiveError> {
        let parts = self.resolve(path)?;
        if self.group_at(&parts).is_none() {
            return Err(ArchiveError::Missing(display_path(&parts)));
        }
        self.cwd = parts;
        Ok(())
    }

    /// Create a group (and any missing parents).
    pub fn create_group(&mut self, path: &str) -> Result<(), ArchiveError> {
        let parts = self.resolve(path)?;
        self.group_at_mut_creating(&parts).map(|_| ())
    }

    /// Whether a group or dataset exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        let Ok(parts) = self.resolve(path) else {
            return false;
        };
        let Some((name, dir)) = parts.split_last() else {
            return true;
        };
        self.group_at(dir)
            .map(|g| g.entries.contains_key(name))
            .unwrap_or(false)
    }

    /// Copy of the group at `path` as a standalone archive.
    pub fn subtree(&self, path: &str) -> Result<Archive, ArchiveError> {
        let parts = self.resolve(path)?;
        let group = self
            .group_at(&parts)
            .ok_or_else(|| ArchiveError::Missing(display_path(&parts)))?;
        Ok(Archive {
            root: group.clone(),
            cwd: Vec::new(),
        })
    }

    /// All datasets in the tree with their absolute paths, in sorted order.
    pub fn datasets(&self) -> Vec<(String, &Dataset)> {
        let mut out = Vec::new();
        collect_datasets(&self.root, String::new(), &mut out);
        out
    }

    /// Absolute paths of all datasets, in sorted order.
    pub fn dataset_paths(&self) -> Vec<String> {
        self.datasets().into_iter().map(|(path, _)| path).collect()
    }

    pub fn set(&mut self, path: &str, dataset: Dataset) -> Result<(), ArchiveError> {
        let parts = self.resolve(path)?;
        let (name, dir) = parts
            .split_last()
            .ok_or_else(|| ArchiveError::InvalidPath(path.to_string()))?;
        let group = self.group_at_mut_creating(dir)?;
        if let Some(Node::Group(_)) = group.entries.get(name) {
            return Err(ArchiveError::WrongKind {
                path: display_path(&parts),
                expected: "dataset",
                found: "group",
            });
        }
        group.entries.insert(name.clone(), Node::Dataset(dataset));
        Ok(())
    }

    pub fn dataset(&self, path: &str) -> Result<&Dataset, ArchiveError> {
        let parts = self.resolve(path)?;
        let (name, dir) = parts
            .split_last()
            .ok_or_else(|| ArchiveError::InvalidPath(path.to_string()))?;
        let group = self
            .group_at(dir)
            .ok_or_else(|| ArchiveError::Missing(display_path(&parts)))?;
        match group.entries.get(name) {
            Some(Node::Dataset(d)) => Ok(d),
            Some(Node::Group(_)) => Err(ArchiveError::WrongKind {
                path: display_path(&parts),
                expected: "dataset",
                found: "group",
            }),
            None => Err(ArchiveError::Missing(display_path(&parts))),
        }
    }

    pub fn set_bool(&mut self, path: &str, value: bool) -> Result<(), ArchiveError> {
        self.set(path, Dataset::Bool(value))
    }

    pub fn set_i64(&mut self, path: &str, value: i64) -> Result<(), ArchiveError> {
        self.set(path, Dataset::Int(value))
    }

    pub fn set_usize(&mut self, path: &str, value: usize) -> Result<(), ArchiveError> {
        self.set(path, Dataset::Int(value as i64))
    }

    pub fn set_f64(&mut self, path: &str, value: f64) -> Result<(), ArchiveError> {
        self.set(path, Dataset::Float(value))
    }

    pub fn set_text(&mut self, path: &str, value: &str) -> Result<(), ArchiveError> {
        self.set(path, Dataset::Text(value.to_string()))
    }

    pub fn set_array<S, D>(&mut self, path: &str, array: &ArrayBase<S, D>) -> Result<(), ArchiveError>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        self.set(
            path,
            Dataset::Array {
                shape: array.shape().to_vec(),
                data: array.iter().copied().collect(),
            },
        )
    }

    pub fn get_bool(&self, path: &str) -> Result<bool, ArchiveError> {
        match self.dataset(path)? {
            Dataset::Bool(v) => Ok(*v),
            Dataset::Int(v) => Ok(*v != 0),
            other => Err(wrong_kind(path, "bool", other)),
        }
    }

    pub fn get_i64(&self, path: &str) -> Result<i64, ArchiveError> {
        match self.dataset(path)? {
            Dataset::Int(v) => Ok(*v),
            other => Err(wrong_kind(path, "integer", other)),
        }
    }

    pub fn get_usize(&self, path: &str) -> Result<usize, ArchiveError> {
        let value = self.get_i64(path)?;
        usize::try_from(value).map_err(|_| ArchiveError::InvalidValue {
            path: path.to_string(),
            reason: format!("expected a non-negative integer, got {value}"),
        })
    }

    pub fn get_f64(&self, path: &str) -> Result<f64, ArchiveError> {
        match self.dataset(path)? {
            Dataset::Float(v) => Ok(*v),
            Dataset::Int(v) => Ok(*v as f64),
            other => Err(wrong_kind(path, "float", other)),
        }
    }

    pub fn get_text(&self, path: &str) -> Result<String, ArchiveError> {
        match self.dataset(path)? {
            Dataset::Text(v) => Ok(v.clone()),
            other => Err(wrong_kind(path, "string", other)),
        }
    }

    pub fn get_array<D: Dimension>(&self, path: &str) -> Result<Array<f64, D>, ArchiveError> {
        match self.dataset(path)? {
            Dataset::Array { shape, data } => {
                let shape_error = || ArchiveError::Shape {
                    path: path.to_string(),
                    expected: match D::NDIM {
                        Some(n) => format!("a {n}-d array"),
                        None => "an array".to_string(),
                    },
                    found: shape.clone(),
                };
                ArrayD::from_shape_vec(IxDyn(shape), data.clone())
                    .map_err(|_| shape_error())?
                    .into_dimensionality::<D>()
                    .map_err(|_| shape_error())
            }
            other => Err(wrong_kind(path, "array", other)),
        }
    }

    pub fn get_array1(&self, path: &str) -> Result<Array1<f64>, ArchiveError> {
        self.get_array(path)
    }

    pub fn get_array2(&self, path: &str) -> Result<Array2<f64>, ArchiveError> {
        self.get_array(path)
    }

    /// Compare every dataset of two archives.
    ///
    /// Floats and array elements may differ by at most `tolerance`; all other
    /// values and every shape must match exactly.
    pub fn compare(&self, other: &Archive, tolerance: f64) -> Result<(), ArchiveMismatch> {
        let ours: BTreeMap<String, &Dataset> = self.datasets().into_iter().collect();
        let theirs: BTreeMap<String, &Dataset> = other.datasets().into_iter().collect();

        for (path, a) in &ours {
            let Some(b) = theirs.get(path) else {
                return Err(ArchiveMismatch {
                    path: path.clone(),
                    reason: "missing from the other archive".to_string(),
                });
            };
            compare_datasets(a, b, tolerance).map_err(|reason| ArchiveMismatch {
                path: path.clone(),
                reason,
            })?;
        }
        if let Some(path) = theirs.keys().find(|p| !ours.contains_key(*p)) {
            return Err(ArchiveMismatch {
                path: path.clone(),
                reason: "missing from this archive".to_string(),
            });
        }
        Ok(())
    }

    fn resolve(&self, path: &str) -> Result<Vec<String>, ArchiveError> {
        let mut parts = if path.starts_with('/') {
            Vec::new()
        } else {
            self.cwd.clone()
        };
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(ArchiveError::InvalidPath(path.to_string()));
                    }
                }
                name => parts.push(name.to_string()),
            }
        }
        Ok(parts)
    }

    fn group_at(&self, parts: &[String]) -> Option<&Group> {
        let mut group = &self.root;
        for part in parts {
            match group.entries.get(part)? {
                Node::Group(g) => group = g,
                Node::Dataset(_) => return None,
            }
        }
        Some(group)
    }

    fn group_at_mut_creating(&mut self, parts: &[String]) -> Result<&mut Group, ArchiveError> {
        let mut group = &mut self.root;
        for (i, part) in parts.iter().enumerate() {
            let node = group
                .entries
                .entry(part.clone())
                .or_insert_with(|| Node::Group(Group::default()));
            match node {
                Node::Group(g) => group = g,
                Node::Dataset(_) => {
                    return Err(ArchiveError::WrongKind {
                        path: display_path(&parts[..=i]),
                        expected: "group",
                        found: "dataset",
                    })
                }
            }
        }
        Ok(group)
    }
}

/// A value with a fixed layout inside an archive group.
///
/// `save` writes into the archive's current group and `load` reads from it,
/// so composite artifacts nest by changing groups around the call.
pub trait Artifact: Sized {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError>;
    fn load(archive: &Archive) -> Result<Self, ArchiveError>;
}

impl<D: Dimension> Artifact for Array<f64, D> {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_array(ARRAY_DATASET, self)
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        archive.get_array(ARRAY_DATASET)
    }
}

/// Lists are stored as `size` plus one group `item{i}` per element.
impl<T: Artifact> Artifact for Vec<T> {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_usize("size", self.len())?;
        for (i, item) in self.iter().enumerate() {
            let name = format!("item{i}");
            archive.create_group(&name)?;
            archive.cd(&name)?;
            let saved = item.save(archive);
            archive.cd("..")?;
            saved?;
        }
        Ok(())
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        let size = archive.get_usize("size")?;
        (0..size)
            .map(|i| T::load(&archive.subtree(&format!("item{i}"))?))
            .collect()
    }
}

/// Read a single artifact stored at the root of an archive file.
pub fn read_artifact<T: Artifact>(path: &Path) -> Result<T, ArchiveError> {
    T::load(&Archive::read(path)?)
}

/// Write a single artifact as the root of a new archive file.
pub fn write_artifact<T: Artifact>(value: &T, path: &Path) -> Result<(), ArchiveError> {
    let mut archive = Archive::new();
    value.save(&mut archive)?;
    archive.write(path)
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
}

fn display_path(parts: &[String]) -> String {
    format!("/{}", parts.join("/"))
}

fn wrong_kind(path: &str, expected: &'static str, found: &Dataset) -> ArchiveError {
    ArchiveError::WrongKind {
        path: path.to_string(),
        expected,
        found: found.kind(),
    }
}

fn collect_datasets<'a>(group: &'a Group, prefix: String, out: &mut Vec<(String, &'a Dataset)>) {
    for (name, node) in &group.entries {
        let path = format!("{prefix}/{name}");
        match node {
            Node::Dataset(d) => out.push((path, d)),
            Node::Group(g) => collect_datasets(g, path, out),
        }
    }
}

fn close(a: f64, b: f64, tolerance: f64) -> bool {
    a == b || (a - b).abs() <= tolerance || (a.is_nan() && b.is_nan())
}

fn compare_datasets(a: &Dataset, b: &Dataset, tolerance: f64) -> Result<(), String> {
    match (a, b) {
        (Dataset::Float(x), Dataset::Float(y)) => {
            if close(*x, *y, tolerance) {
                Ok(())
            } else {
                Err(format!("{x} differs from {y}"))
            }
        }
        (
            Dataset::Array {
                shape: sa,
                data: da,
            },
            Dataset::Array {
                shape: sb,
                data: db,
            },
        ) => {
            if sa != sb {
                return Err(format!("shape {sa:?} differs from {sb:?}"));
            }
            match da
                .iter()
                .zip(db.iter())
                .position(|(x, y)| !close(*x, *y, tolerance))
            {
                Some(i) => Err(format!("element {i}: {} differs from {}", da[i], db[i])),
                None => Ok(()),
            }
        }
        _ if a == b => Ok(()),
        _ if a.kind() != b.kind() => Err(format!("{} differs from {}", a.kind(), b.kind())),
        _ => Err(format!("{a} differs from {b}")),
    }
}
