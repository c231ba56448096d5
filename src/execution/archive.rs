//! Tar archives for moving files in and out of containers
//!
//! Everything here is blocking I/O; callers run it on the blocking pool.

use crate::execution::paths;
use std::fs;
use std::io;
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};

/// One side of a copy after symlink resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyInfo {
    pub path: String,
    pub exists: bool,
    pub is_dir: bool,
    /// Name the archive's top entry should carry instead of the path's base
    pub rebase_name: Option<String>,
}

/// Resolve a host source path, following symlinks
pub fn source_info(path: &str) -> io::Result<CopyInfo> {
    let resolved = fs::canonicalize(path)?;
    let (resolved, rebase_name) = paths::rebase_name(path, &resolved.to_string_lossy());
    let metadata = fs::symlink_metadata(paths::clean(&resolved))?;
    Ok(CopyInfo {
        path: resolved,
        exists: true,
        is_dir: metadata.is_dir(),
        rebase_name,
    })
}

/// Archive a host source. The top entry is named after the source's base
/// (or its rebase name); a source ending in `/.` contributes only its contents.
pub fn pack(source: &CopyInfo) -> io::Result<Vec<u8>> {
    let (_, source_base) = paths::split_dir_entry(&source.path);
    let top = source.rebase_name.clone().unwrap_or(source_base);
    let on_disk = paths::clean(&source.path);

    let mut builder = Builder::new(Vec::new());
    builder.follow_symlinks(false);
    if source.is_dir {
        if top == "." {
            builder.append_dir(".", &on_disk)?;
            for entry in fs::read_dir(&on_disk)? {
                let entry = entry?;
                let name = entry.file_name();
                if entry.file_type()?.is_dir() {
                    builder.append_dir_all(&name, entry.path())?;
                } else {
                    builder.append_path_with_name(entry.path(), &name)?;
                }
            }
        } else {
            builder.append_dir_all(&top, &on_disk)?;
        }
    } else {
        builder.append_path_with_name(&on_disk, &top)?;
    }
    builder.into_inner()
}

/// Archive holding a single regular file with the given content
pub fn single_file(name: &str, content: &[u8], mtime: u64) -> io::Result<Vec<u8>> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(content.len() as u64);
    header.set_mode(0o600);
    header.set_mtime(mtime);

    let mut builder = Builder::new(Vec::new());
    builder.append_data(&mut header, name, content)?;
    builder.into_inner()
}

/// Rename `old_base` to `new_base` at the top of every entry, including
/// hard link targets
pub fn rebase(archive: &[u8], old_base: &str, new_base: &str) -> io::Result<Vec<u8>> {
    let mut source = Archive::new(archive);
    let mut builder = Builder::new(Vec::new());

    for entry in source.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let renamed = rebase_entry_name(&name, old_base, new_base);
        let mut header = entry.header().clone();
        let entry_type = header.entry_type();

        if entry_type.is_hard_link() || entry_type.is_symlink() {
            let target = entry
                .link_name_bytes()
                .map(|t| String::from_utf8_lossy(&t).into_owned())
                .unwrap_or_default();
            let target = if entry_type.is_hard_link() {
                rebase_entry_name(&target, old_base, new_base)
            } else {
                target
            };
            builder.append_link(&mut header, &renamed, &target)?;
        } else {
            builder.append_data(&mut header, &renamed, &mut entry)?;
        }
    }
    builder.into_inner()
}

/// The first element of `name` is compared with `old_base`; the rest is kept.
/// Archives written here lose the `./` prefix of contents-only entries, so
/// with an `old_base` of `.` any relative name counts as below it.
fn rebase_entry_name(name: &str, old_base: &str, new_base: &str) -> String {
    let (first, rest) = match name.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (name, None),
    };
    if first == old_base {
        return match rest {
            Some(rest) => format!("{}/{}", new_base, rest),
            None => new_base.to_string(),
        };
    }
    if old_base == "." && !name.starts_with('/') {
        return format!("{}/{}", new_base, name);
    }
    name.to_string()
}

/// Extract into `destination`, refusing to replace a directory with a
/// non-directory or the other way around
pub fn unpack(archive: &[u8], destination: &Path) -> io::Result<()> {
    let mut archive = Archive::new(archive);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let target = destination.join(entry.path()?);
        if let Ok(existing) = fs::symlink_metadata(&target) {
            let incoming_dir = entry.header().entry_type().is_dir();
            if existing.is_dir() && !incoming_dir {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("cannot overwrite directory {} with non-directory", target.display()),
                ));
            }
            if !existing.is_dir() && incoming_dir {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("cannot overwrite non-directory {} with directory", target.display()),
                ));
            }
        }
        entry.unpack_in(destination)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn entry_names(archive: &[u8]) -> Vec<String> {
        let mut archive = Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().trim_end_matches('/').to_string())
            .collect()
    }

    #[test]
    fn test_single_file_header() {
        let archive = single_file("VERSION", b"1.2.3", 1_700_000_000).unwrap();
        let mut archive = Archive::new(&archive[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "VERSION");
        assert_eq!(entry.header().mode().unwrap(), 0o600);
        assert_eq!(entry.header().mtime().unwrap(), 1_700_000_000);
        assert_eq!(entry.size(), 5);
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "1.2.3");
    }

    #[test]
    fn test_pack_directory_uses_base_name() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("configs");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a.yml"), "a: 1").unwrap();

        let info = source_info(&dir.to_string_lossy()).unwrap();
        assert!(info.is_dir);
        let names = entry_names(&pack(&info).unwrap());
        assert!(names.contains(&"configs".to_string()));
        assert!(names.contains(&"configs/a.yml".to_string()));
    }

    #[test]
    fn test_pack_directory_contents_only() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let path = format!("{}/.", tmp.path().display());

        let info = source_info(&path).unwrap();
        let names = entry_names(&pack(&info).unwrap());
        assert_eq!(names, vec![".".to_string(), "a.txt".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_source_symlink_keeps_link_name() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("real.txt"), "data").unwrap();
        let link = tmp.path().join("alias.txt");
        std::os::unix::fs::symlink(tmp.path().join("real.txt"), &link).unwrap();

        let info = source_info(&link.to_string_lossy()).unwrap();
        assert_eq!(info.rebase_name.as_deref(), Some("alias.txt"));
        assert_eq!(entry_names(&pack(&info).unwrap()), vec!["alias.txt".to_string()]);
    }

    #[test]
    fn test_rebase_renames_top_entry_only() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("build");
        fs::create_dir_all(dir.join("build")).unwrap();
        fs::write(dir.join("build").join("out.bin"), "x").unwrap();
        let archive = pack(&source_info(&dir.to_string_lossy()).unwrap()).unwrap();

        let mut names = entry_names(&rebase(&archive, "build", "artifacts").unwrap());
        names.sort();
        assert_eq!(
            names,
            vec![
                "artifacts".to_string(),
                "artifacts/build".to_string(),
                "artifacts/build/out.bin".to_string()
            ]
        );
    }

    #[test]
    fn test_rebase_entry_name_compares_first_element() {
        assert_eq!(rebase_entry_name("out/", "out", "results"), "results/");
        assert_eq!(rebase_entry_name("out/a/b.txt", "out", "results"), "results/a/b.txt");
        assert_eq!(rebase_entry_name("outer/b.txt", "out", "results"), "outer/b.txt");
        assert_eq!(rebase_entry_name("./", ".", "fresh"), "fresh/");
        assert_eq!(rebase_entry_name("./report.txt", ".", "fresh"), "fresh/report.txt");
        assert_eq!(rebase_entry_name("report.txt", ".", "fresh"), "fresh/report.txt");
    }

    #[test]
    fn test_contents_only_archive_rebases_under_new_name() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let info = source_info(&format!("{}/.", tmp.path().display())).unwrap();

        let mut names = entry_names(&rebase(&pack(&info).unwrap(), ".", "fresh").unwrap());
        names.sort();
        assert_eq!(names, vec!["fresh".to_string(), "fresh/a.txt".to_string()]);
    }

    #[test]
    fn test_unpack_writes_files() {
        let tmp = tempdir().unwrap();
        let archive = single_file("hello.txt", b"hi", 0).unwrap();
        unpack(&archive, tmp.path()).unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("hello.txt")).unwrap(), "hi");
    }

    #[test]
    fn test_unpack_refuses_to_replace_directory_with_file() {
        let tmp = tempdir().unwrap();
        fs::create_dir(tmp.path().join("hello.txt")).unwrap();
        let archive = single_file("hello.txt", b"hi", 0).unwrap();
        let err = unpack(&archive, tmp.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
