//! Virtual filesystem — in-memory node tree overlaid with host volume
//! mounts.
//!
//! Grounded on the teacher's `safe_resolve_path`/`safe_resolve_parent`
//! traversal guards (`host_functions.rs`), generalized from "reject any
//! request outside the sandbox root" into per-mount confinement: a
//! guest path may climb until it would leave its own mounted root, not
//! the process's filesystem root.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use eryx_types::{EryxError, EryxResult, VolumeMount};

/// Result of a `stat` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub kind: FileKind,
    pub len: u64,
}

/// The VFS root. Writes to in-memory nodes are copy-on-write relative
/// to the node tree a `Session` snapshot captured (spec §4.5); cloning
/// the whole `Vfs` is the cheap snapshot mechanism a `Session` uses
/// between `execute()` calls that don't touch the guest's opaque state
/// blob.
#[derive(Clone)]
pub struct Vfs {
    root: std::sync::Arc<std::sync::Mutex<HashMap<String, VfsEntry>>>,
}

#[derive(Clone)]
enum VfsEntry {
    File(std::sync::Arc<Vec<u8>>),
    Directory(HashMap<String, VfsEntry>),
    VolumeRoot { host_path: PathBuf, read_only: bool },
}

impl Vfs {
    pub fn new(mounts: Vec<VolumeMount>) -> EryxResult<Self> {
        let mut root = HashMap::new();
        for mount in mounts {
            insert_volume(&mut root, &mount)?;
        }
        Ok(Self {
            root: std::sync::Arc::new(std::sync::Mutex::new(root)),
        })
    }

    pub fn stat(&self, guest_path: &str) -> EryxResult<Stat> {
        let resolved = self.resolve(guest_path)?;
        match resolved {
            Resolved::Memory(entry) => match entry {
                VfsEntry::File(bytes) => Ok(Stat {
                    kind: FileKind::File,
                    len: bytes.len() as u64,
                }),
                VfsEntry::Directory(_) => Ok(Stat {
                    kind: FileKind::Directory,
                    len: 0,
                }),
                VfsEntry::VolumeRoot { .. } => Ok(Stat {
                    kind: FileKind::Directory,
                    len: 0,
                }),
            },
            Resolved::Host(host_path, _ro) => {
                let meta = std::fs::metadata(&host_path)?;
                Ok(Stat {
                    kind: if meta.is_dir() { FileKind::Directory } else { FileKind::File },
                    len: meta.len(),
                })
            }
        }
    }

    pub fn read(&self, guest_path: &str) -> EryxResult<Vec<u8>> {
        match self.resolve(guest_path)? {
            Resolved::Memory(VfsEntry::File(bytes)) => Ok((*bytes).clone()),
            Resolved::Memory(_) => Err(EryxError::Policy(format!("'{guest_path}' is a directory"))),
            Resolved::Host(host_path, _) => Ok(std::fs::read(host_path)?),
        }
    }

    pub fn write(&self, guest_path: &str, data: &[u8], append: bool) -> EryxResult<()> {
        let (parent_path, name) = split_parent(guest_path)?;
        if let Some((host_root, ro, tail)) = self.find_volume_root(&parent_path)? {
            if ro {
                return Err(EryxError::Policy(format!(
                    "write to read-only volume mount denied: {guest_path}"
                )));
            }
            let host_target = host_target_path(&host_root, &tail, &name)?;
            if let Some(parent) = host_target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if append {
                use std::io::Write;
                let mut f = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&host_target)?;
                f.write_all(data)?;
            } else {
                std::fs::write(&host_target, data)?;
            }
            return Ok(());
        }

        let mut root = self.root.lock().unwrap();
        let dir = navigate_mut(&mut root, &parent_path)?;
        let new_bytes = if append {
            let mut existing = match dir.get(&name) {
                Some(VfsEntry::File(bytes)) => (**bytes).clone(),
                Some(_) => return Err(EryxError::Policy(format!("'{guest_path}' is a directory"))),
                None => Vec::new(),
            };
            existing.extend_from_slice(data);
            existing
        } else {
            data.to_vec()
        };
        dir.insert(name, VfsEntry::File(std::sync::Arc::new(new_bytes)));
        Ok(())
    }

    pub fn mkdir(&self, guest_path: &str) -> EryxResult<()> {
        let (parent_path, name) = split_parent(guest_path)?;
        if let Some((host_root, ro, tail)) = self.find_volume_root(&parent_path)? {
            if ro {
                return Err(EryxError::Policy(format!("mkdir under read-only mount denied: {guest_path}")));
            }
            let host_target = host_target_path(&host_root, &tail, &name)?;
            std::fs::create_dir_all(host_target)?;
            return Ok(());
        }
        let mut root = self.root.lock().unwrap();
        let dir = navigate_mut(&mut root, &parent_path)?;
        dir.entry(name).or_insert_with(|| VfsEntry::Directory(HashMap::new()));
        Ok(())
    }

    pub fn unlink(&self, guest_path: &str) -> EryxResult<()> {
        let (parent_path, name) = split_parent(guest_path)?;
        if let Some((host_root, ro, tail)) = self.find_volume_root(&parent_path)? {
            if ro {
                return Err(EryxError::Policy(format!("unlink under read-only mount denied: {guest_path}")));
            }
            let host_target = host_target_path(&host_root, &tail, &name)?;
            std::fs::remove_file(host_target)?;
            return Ok(());
        }
        let mut root = self.root.lock().unwrap();
        let dir = navigate_mut(&mut root, &parent_path)?;
        dir.remove(&name)
            .map(|_| ())
            .ok_or_else(|| EryxError::Policy(format!("no such file: {guest_path}")))
    }

    pub fn rename(&self, from: &str, to: &str) -> EryxResult<()> {
        let data = self.read(from)?;
        self.write(to, &data, false)?;
        self.unlink(from)
    }

    pub fn list(&self, guest_path: &str) -> EryxResult<Vec<String>> {
        match self.resolve(guest_path)? {
            Resolved::Memory(VfsEntry::Directory(entries)) => {
                let mut names: Vec<String> = entries.keys().cloned().collect();
                names.sort();
                Ok(names)
            }
            Resolved::Memory(VfsEntry::VolumeRoot { host_path, .. }) => list_host_dir(&host_path),
            Resolved::Memory(VfsEntry::File(_)) => {
                Err(EryxError::Policy(format!("'{guest_path}' is a file")))
            }
            Resolved::Host(host_path, _) => list_host_dir(&host_path),
        }
    }

    fn resolve(&self, guest_path: &str) -> EryxResult<Resolved> {
        let components = normalized_components(guest_path)?;
        let root = self.root.lock().unwrap();
        let mut cursor: &HashMap<String, VfsEntry> = &root;
        let mut volume: Option<(PathBuf, bool)> = None;
        let mut consumed_in_volume: Vec<String> = Vec::new();

        for (i, component) in components.iter().enumerate() {
            if let Some((host_root, ro)) = &volume {
                consumed_in_volume.push(component.clone());
                if i == components.len() - 1 {
                    let full = join_host(host_root, &consumed_in_volume);
                    confine(host_root, &full)?;
                    return Ok(Resolved::Host(full, *ro));
                }
                continue;
            }
            match cursor.get(component) {
                Some(VfsEntry::Directory(next)) => {
                    if i == components.len() - 1 {
                        return Ok(Resolved::Memory(VfsEntry::Directory(next.clone())));
                    }
                    cursor = next;
                }
                Some(VfsEntry::VolumeRoot { host_path, read_only }) => {
                    if i == components.len() - 1 {
                        return Ok(Resolved::Memory(VfsEntry::VolumeRoot {
                            host_path: host_path.clone(),
                            read_only: *read_only,
                        }));
                    }
                    volume = Some((host_path.clone(), *read_only));
                }
                Some(VfsEntry::File(bytes)) => {
                    if i == components.len() - 1 {
                        return Ok(Resolved::Memory(VfsEntry::File(bytes.clone())));
                    }
                    return Err(EryxError::Policy(format!("'{guest_path}' traverses a file")));
                }
                None => return Err(EryxError::Policy(format!("no such path: {guest_path}"))),
            }
        }
        Ok(Resolved::Memory(VfsEntry::Directory((*cursor).clone())))
    }

    /// Walk `guest_dir`'s components and, if it passes through a
    /// `VolumeRoot`, return the mount's host path, its read-only flag,
    /// and the components of `guest_dir` still unconsumed *below* the
    /// mount point — e.g. for a mount at `/mnt/d` and `guest_dir =
    /// "/mnt/d/sub"` this returns `tail = ["sub"]`, so callers can
    /// rebuild the full host-relative path instead of discarding
    /// everything past the mount's immediate parent.
    fn find_volume_root(&self, guest_dir: &str) -> EryxResult<Option<(PathBuf, bool, Vec<String>)>> {
        let components = normalized_components(guest_dir)?;
        let root = self.root.lock().unwrap();
        let mut cursor: &HashMap<String, VfsEntry> = &root;
        for (i, component) in components.iter().enumerate() {
            match cursor.get(component) {
                Some(VfsEntry::Directory(next)) => cursor = next,
                Some(VfsEntry::VolumeRoot { host_path, read_only }) => {
                    let tail = components[i + 1..].to_vec();
                    return Ok(Some((host_path.clone(), *read_only, tail)));
                }
                _ => return Ok(None),
            }
        }
        Ok(None)
    }
}

enum Resolved {
    Memory(VfsEntry),
    Host(PathBuf, bool),
}

fn normalized_components(guest_path: &str) -> EryxResult<Vec<String>> {
    if !guest_path.starts_with('/') {
        return Err(EryxError::Policy(format!("guest path must be absolute: {guest_path}")));
    }
    let mut out = Vec::new();
    for component in Path::new(guest_path).components() {
        match component {
            Component::Normal(part) => out.push(part.to_string_lossy().into_owned()),
            Component::RootDir => {}
            Component::ParentDir => {
                // Climbing above the mount/tree root is a policy
                // violation, not a silent clamp (spec §4.5: "escape
                // attempts resolve to a permission error").
                if out.pop().is_none() {
                    return Err(EryxError::Policy(format!(
                        "path escapes its root: {guest_path}"
                    )));
                }
            }
            Component::CurDir => {}
            Component::Prefix(_) => {
                return Err(EryxError::Policy(format!("invalid guest path: {guest_path}")))
            }
        }
    }
    Ok(out)
}

fn split_parent(guest_path: &str) -> EryxResult<(String, String)> {
    let components = normalized_components(guest_path)?;
    let Some((name, parent)) = components.split_last() else {
        return Err(EryxError::Policy("cannot operate on root".into()));
    };
    let parent_path = if parent.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parent.join("/"))
    };
    Ok((parent_path, name.clone()))
}

fn navigate_mut<'a>(
    root: &'a mut HashMap<String, VfsEntry>,
    guest_dir: &str,
) -> EryxResult<&'a mut HashMap<String, VfsEntry>> {
    let components = normalized_components(guest_dir)?;
    let mut cursor = root;
    for component in components {
        let entry = cursor
            .entry(component.clone())
            .or_insert_with(|| VfsEntry::Directory(HashMap::new()));
        match entry {
            VfsEntry::Directory(next) => cursor = next,
            VfsEntry::VolumeRoot { .. } => {
                return Err(EryxError::Policy(
                    "cannot create in-memory entries inside a volume mount".into(),
                ))
            }
            VfsEntry::File(_) => {
                return Err(EryxError::Policy(format!("'{component}' is a file, not a directory")))
            }
        }
    }
    Ok(cursor)
}

/// Build the host path for `name` inside a mount, given the tail
/// components `find_volume_root` reported between the mount point and
/// `name`'s parent directory — e.g. mount host root `/h`, `tail =
/// ["sub"]`, `name = "f"` yields `/h/sub/f`, not `/h/f`.
fn host_target_path(host_root: &Path, tail: &[String], name: &str) -> EryxResult<PathBuf> {
    let mut full = host_root.to_path_buf();
    for component in tail {
        full.push(component);
    }
    full.push(name);
    confine(host_root, &full)?;
    Ok(full)
}

fn join_host(host_root: &Path, tail_components: &[String]) -> PathBuf {
    let mut p = host_root.to_path_buf();
    for c in tail_components {
        p.push(c);
    }
    p
}

/// Reject a resolved host path that would land outside `host_root`,
/// defeating symlink or `..`-based escapes that survive normalization.
fn confine(host_root: &Path, candidate: &Path) -> EryxResult<()> {
    let root_canon = host_root
        .canonicalize()
        .unwrap_or_else(|_| host_root.to_path_buf());
    let check_against = candidate
        .parent()
        .and_then(|p| p.canonicalize().ok())
        .unwrap_or_else(|| candidate.to_path_buf());
    if !check_against.starts_with(&root_canon) {
        return Err(EryxError::Policy(format!(
            "path escapes mounted volume root: {}",
            candidate.display()
        )));
    }
    Ok(())
}

fn list_host_dir(path: &Path) -> EryxResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn insert_volume(root: &mut HashMap<String, VfsEntry>, mount: &VolumeMount) -> EryxResult<()> {
    let components = normalized_components(&mount.guest_path)?;
    let Some((name, parents)) = components.split_last() else {
        return Err(EryxError::Initialization("volume mount guest path cannot be root".into()));
    };
    let mut cursor = root;
    for component in parents {
        let entry = cursor
            .entry(component.clone())
            .or_insert_with(|| VfsEntry::Directory(HashMap::new()));
        match entry {
            VfsEntry::Directory(next) => cursor = next,
            _ => {
                return Err(EryxError::Initialization(format!(
                    "volume mount path conflicts with an existing node: {}",
                    mount.guest_path
                )))
            }
        }
    }
    cursor.insert(
        name.clone(),
        VfsEntry::VolumeRoot {
            host_path: mount.host_path.clone(),
            read_only: mount.read_only,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_in_memory_file() {
        let vfs = Vfs::new(vec![]).unwrap();
        vfs.write("/tmp/a.txt", b"hello", false).unwrap();
        assert_eq!(vfs.read("/tmp/a.txt").unwrap(), b"hello");
    }

    #[test]
    fn append_extends_existing_content() {
        let vfs = Vfs::new(vec![]).unwrap();
        vfs.write("/f", b"a", false).unwrap();
        vfs.write("/f", b"b", true).unwrap();
        assert_eq!(vfs.read("/f").unwrap(), b"ab");
    }

    #[test]
    fn parent_escape_above_root_is_denied() {
        let vfs = Vfs::new(vec![]).unwrap();
        let err = vfs.write("/../etc/passwd", b"x", false).unwrap_err();
        assert_eq!(err.kind_name(), "policy");
    }

    #[test]
    fn rw_volume_writes_through_to_host() {
        let dir = tempfile::tempdir().unwrap();
        let mount = VolumeMount {
            host_path: dir.path().to_path_buf(),
            guest_path: "/mnt/d".to_string(),
            read_only: false,
        };
        let vfs = Vfs::new(vec![mount]).unwrap();
        vfs.write("/mnt/d/f", b"x", false).unwrap();
        let on_disk = std::fs::read(dir.path().join("f")).unwrap();
        assert_eq!(on_disk, b"x");
    }

    #[test]
    fn nested_write_under_a_mount_lands_below_the_mount_not_at_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let mount = VolumeMount {
            host_path: dir.path().to_path_buf(),
            guest_path: "/mnt/d".to_string(),
            read_only: false,
        };
        let vfs = Vfs::new(vec![mount]).unwrap();
        vfs.write("/mnt/d/sub/f", b"x", false).unwrap();
        let on_disk = std::fs::read(dir.path().join("sub").join("f")).unwrap();
        assert_eq!(on_disk, b"x");
        assert!(!dir.path().join("f").exists());
    }

    #[test]
    fn ro_volume_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mount = VolumeMount {
            host_path: dir.path().to_path_buf(),
            guest_path: "/mnt/d".to_string(),
            read_only: true,
        };
        let vfs = Vfs::new(vec![mount]).unwrap();
        let err = vfs.write("/mnt/d/f", b"x", false).unwrap_err();
        assert_eq!(err.kind_name(), "policy");
    }

    #[test]
    fn list_in_memory_directory() {
        let vfs = Vfs::new(vec![]).unwrap();
        vfs.write("/dir/a", b"1", false).unwrap();
        vfs.write("/dir/b", b"2", false).unwrap();
        let mut names = vfs.list("/dir").unwrap();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
