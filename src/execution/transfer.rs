//! Archive transfer unit
//!
//! Moves files between the host and a container with the same rules as
//! `docker cp`: symbolic links are resolved on both sides, a trailing `/` or
//! `/.` asserts a directory, and the archive's top entry is renamed when the
//! destination names a new file or directory.

use crate::core::config::FileTransfer;
use crate::engine::{ContainerEngine, EngineError};
use crate::execution::archive::{self, CopyInfo};
use crate::execution::paths;
use futures_util::StreamExt;
use globset::GlobBuilder;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Symlink hops followed when resolving a host destination
const MAX_SYMLINK_HOPS: usize = 10;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid glob pattern <{pattern}>: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("no file matches <{0}>")]
    NoMatch(String),

    #[error("failed to stat <{path}> in container: {source}")]
    Stat {
        path: String,
        #[source]
        source: EngineError,
    },

    #[error("destination <{0}> must be a directory or a regular file")]
    InvalidDestination(String),

    #[error("invalid output path <{path}>: {reason}")]
    InvalidOutputPath { path: String, reason: String },

    #[error("cannot copy a directory onto existing file <{0}>")]
    CannotCopyDir(String),

    #[error("destination directory <{0}> does not exist")]
    DirNotExists(String),

    #[error("too many levels of symbolic links at <{0}>")]
    TooManySymlinks(String),

    #[error("failed to copy <{path}>: {source}")]
    Copy {
        path: String,
        #[source]
        source: EngineError,
    },

    #[error("archive error for <{path}>: {source}")]
    Archive {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    fn archive(path: &str) -> impl FnOnce(io::Error) -> TransferError + '_ {
        move |source| TransferError::Archive {
            path: path.to_string(),
            source,
        }
    }
}

/// Brace alternates are not glob syntax here; match `{` and `}` literally
fn literal_braces(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    let mut in_class = false;
    for c in pattern.chars() {
        match c {
            '[' if !in_class => {
                in_class = true;
                escaped.push(c);
            }
            ']' if in_class => {
                in_class = false;
                escaped.push(c);
            }
            '{' | '}' if !in_class => {
                escaped.push('[');
                escaped.push(c);
                escaped.push(']');
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Expand a host glob. `*`, `?` and `[...]` never match `/`; braces are
/// ordinary characters.
pub fn expand_glob(pattern: &str) -> Result<Vec<String>, TransferError> {
    let is_meta = |c: char| matches!(c, '*' | '?' | '[');
    if !pattern.contains(is_meta) {
        return Ok(match fs::symlink_metadata(pattern) {
            Ok(_) => vec![pattern.to_string()],
            Err(_) => Vec::new(),
        });
    }

    let matcher = GlobBuilder::new(&literal_braces(pattern))
        .literal_separator(true)
        .build()
        .map_err(|err| TransferError::InvalidPattern {
            pattern: pattern.to_string(),
            message: err.to_string(),
        })?
        .compile_matcher();

    let components: Vec<&str> = pattern.split('/').collect();
    let literal = components.iter().take_while(|c| !c.contains(is_meta)).count();
    let mut prefix = components[..literal].join("/");
    if prefix.is_empty() && pattern.starts_with('/') {
        prefix = "/".to_string();
    }
    let root = if prefix.is_empty() {
        ".".to_string()
    } else {
        prefix.clone()
    };
    let depth = components.len() - literal;

    let mut matches: Vec<String> = WalkDir::new(&root)
        .min_depth(1)
        .max_depth(depth)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(&root).ok()?.to_string_lossy().into_owned();
            let candidate = match prefix.as_str() {
                "" => relative,
                "/" => format!("/{}", relative),
                _ => format!("{}/{}", prefix, relative),
            };
            matcher.is_match(&candidate).then_some(candidate)
        })
        .collect();
    matches.sort();
    Ok(matches)
}

/// Decide where an archive of `source` must be extracted so that it lands at
/// `destination`, renaming its top entry when needed.
/// Returns the directory to extract into and the (possibly rewritten) archive.
pub fn prepare_copy(
    content: Vec<u8>,
    source: &CopyInfo,
    destination: &CopyInfo,
) -> Result<(String, Vec<u8>), TransferError> {
    let (_, mut source_base) = paths::split_dir_entry(&source.path);
    if let Some(name) = &source.rebase_name {
        source_base = name.clone();
    }
    let (dest_dir, dest_base) = paths::split_dir_entry(&destination.path);

    let rebase = |content: Vec<u8>| -> Result<Vec<u8>, TransferError> {
        if source_base == dest_base {
            return Ok(content);
        }
        archive::rebase(&content, &source_base, &dest_base)
            .map_err(TransferError::archive(&destination.path))
    };

    if destination.exists && destination.is_dir {
        // Extract into the destination directory
        return Ok((destination.path.clone(), content));
    }
    if destination.exists && source.is_dir {
        return Err(TransferError::CannotCopyDir(destination.path.clone()));
    }
    if destination.exists {
        // Replace the existing file
        return Ok((dest_dir, rebase(content)?));
    }
    if source.is_dir {
        // Create the destination directory from the source's contents
        return Ok((dest_dir, rebase(content)?));
    }
    if paths::asserts_directory(&destination.path) {
        return Err(TransferError::DirNotExists(destination.path.clone()));
    }
    Ok((dest_dir, rebase(content)?))
}

/// Resolve a host copy destination, following up to ten symbolic links.
/// A missing destination is fine as long as its parent exists.
pub fn host_destination_info(path: &str) -> Result<CopyInfo, TransferError> {
    let mut current = path.to_string();
    for _ in 0..MAX_SYMLINK_HOPS {
        let metadata = match fs::symlink_metadata(&current) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let parent = paths::split_dir_entry(&current).0;
                return match fs::metadata(&parent) {
                    Ok(meta) if meta.is_dir() => Ok(CopyInfo {
                        path: current,
                        ..Default::default()
                    }),
                    Ok(_) => Err(TransferError::InvalidOutputPath {
                        path: current,
                        reason: format!("{} is not a directory", parent),
                    }),
                    Err(err) => Err(TransferError::archive(&parent)(err)),
                };
            }
            Err(err) => return Err(TransferError::archive(&current)(err)),
        };

        if !metadata.file_type().is_symlink() {
            return Ok(CopyInfo {
                path: current,
                exists: true,
                is_dir: metadata.is_dir(),
                rebase_name: None,
            });
        }

        let target = fs::read_link(&current).map_err(TransferError::archive(&current))?;
        let resolved = paths::resolve_link(&current, &target.to_string_lossy());
        current = paths::preserve_trailing_dot_or_separator(&resolved, path);
    }
    Err(TransferError::TooManySymlinks(path.to_string()))
}

/// Check that a host output path can be written: its parent directory exists
/// and an existing path is a directory or a regular file
pub fn validate_output_path(path: &str) -> Result<(), TransferError> {
    let (parent, _) = paths::split_dir_entry(path);
    let invalid = |reason: String| TransferError::InvalidOutputPath {
        path: path.to_string(),
        reason,
    };

    match fs::metadata(&parent) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(invalid(format!("{} is not a directory", parent))),
        Err(_) => return Err(invalid(format!("destination directory {} does not exist", parent))),
    }

    match fs::metadata(paths::clean(path)) {
        Ok(meta) if meta.is_dir() || meta.is_file() => Ok(()),
        Ok(_) => Err(invalid("not a directory or a regular file".to_string())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if paths::asserts_directory(path) {
                Err(invalid("destination directory does not exist".to_string()))
            } else {
                Ok(())
            }
        }
        Err(err) => Err(invalid(err.to_string())),
    }
}

/// Copies files between the host and one container
pub struct FileTransferUnit<'a, E> {
    engine: &'a E,
}

impl<'a, E: ContainerEngine> FileTransferUnit<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        Self { engine }
    }

    /// Copy host files (or an inline file) into the container below `workdir`
    pub async fn inject(&self, id: &str, transfer: &FileTransfer, workdir: &str) -> Result<(), TransferError> {
        match transfer {
            FileTransfer::InjectGlob(pattern) => {
                let matches = expand_glob(pattern)?;
                if matches.is_empty() {
                    return Err(TransferError::NoMatch(pattern.clone()));
                }
                for source in matches {
                    self.inject_path(id, &source, workdir).await?;
                }
                Ok(())
            }
            FileTransfer::InjectContent { name, content } => {
                let mtime = chrono::Utc::now().timestamp().max(0) as u64;
                let tar = archive::single_file(name, content.as_bytes(), mtime)
                    .map_err(TransferError::archive(name))?;
                debug!("Injecting inline file {} into {}", name, workdir);
                self.engine
                    .copy_to_container(id, workdir, tar)
                    .await
                    .map_err(|source| TransferError::Copy {
                        path: name.clone(),
                        source,
                    })
            }
            FileTransfer::Extract { path, .. } => Err(TransferError::InvalidPattern {
                pattern: path.clone(),
                message: "extract entries cannot be injected".to_string(),
            }),
        }
    }

    /// Copy a path below `workdir` out of the container to the host
    pub async fn extract(&self, id: &str, transfer: &FileTransfer, workdir: &str) -> Result<(), TransferError> {
        let (path, destination) = match transfer {
            FileTransfer::Extract { path, destination } => (path, destination),
            other => {
                return Err(TransferError::InvalidPattern {
                    pattern: format!("{:?}", other),
                    message: "inject entries cannot be extracted".to_string(),
                })
            }
        };

        let absolute = paths::absolute(destination).map_err(TransferError::archive(destination))?;
        let dest_path = paths::preserve_trailing_dot_or_separator(&absolute, destination);
        validate_output_path(&dest_path)?;

        let source_path = format!("{}/{}", workdir.trim_end_matches('/'), path);
        let stat = self
            .engine
            .stat_path(id, &source_path)
            .await
            .map_err(|source| TransferError::Stat {
                path: source_path.clone(),
                source,
            })?;
        let (source_path, rebase_name) = if stat.is_symlink() {
            let target = paths::resolve_link(&source_path, &stat.link_target);
            paths::rebase_name(&source_path, &target)
        } else {
            (source_path, None)
        };

        let (mut chunks, stat) = self
            .engine
            .copy_from_container(id, &source_path)
            .await
            .map_err(|source| TransferError::Copy {
                path: source_path.clone(),
                source,
            })?;
        let mut content = Vec::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|source| TransferError::Copy {
                path: source_path.clone(),
                source,
            })?;
            content.extend_from_slice(&chunk);
        }

        let source = CopyInfo {
            path: source_path,
            exists: true,
            is_dir: stat.is_dir(),
            rebase_name,
        };
        debug!("Extracting {} to {}", source.path, dest_path);
        run_blocking(move || copy_to_host(content, &source, &dest_path)).await
    }

    async fn inject_path(&self, id: &str, source: &str, workdir: &str) -> Result<(), TransferError> {
        let raw = match source.rfind('/') {
            Some(pos) => format!("{}/{}", workdir, source[..pos].trim_start_matches('/')),
            None => workdir.to_string(),
        };
        let dest_path = paths::preserve_trailing_dot_or_separator(&paths::clean(&raw), &raw);

        let mut destination = CopyInfo {
            path: dest_path.clone(),
            ..Default::default()
        };
        let mut stat = self.stat(id, &dest_path).await?;
        if stat.is_symlink() {
            let target = paths::resolve_link(&dest_path, &stat.link_target);
            stat = self.stat(id, &target).await?;
            destination.path = target;
        }
        if !(stat.is_dir() || stat.is_regular()) {
            return Err(TransferError::InvalidDestination(destination.path));
        }
        destination.exists = true;
        destination.is_dir = stat.is_dir();

        let owned = source.to_string();
        let (source_info, content) = run_blocking(move || {
            let info = archive::source_info(&owned).map_err(TransferError::archive(&owned))?;
            let content = archive::pack(&info).map_err(TransferError::archive(&owned))?;
            Ok((info, content))
        })
        .await?;

        let (dir, content) = prepare_copy(content, &source_info, &destination)?;
        debug!("Injecting {} into {}", source, dir);
        self.engine
            .copy_to_container(id, &dir, content)
            .await
            .map_err(|err| TransferError::Copy {
                path: source.to_string(),
                source: err,
            })
    }

    async fn stat(&self, id: &str, path: &str) -> Result<crate::engine::PathStat, TransferError> {
        self.engine
            .stat_path(id, path)
            .await
            .map_err(|source| TransferError::Stat {
                path: path.to_string(),
                source,
            })
    }
}

fn copy_to_host(content: Vec<u8>, source: &CopyInfo, dest_path: &str) -> Result<(), TransferError> {
    let content = match &source.rebase_name {
        Some(name) => archive::rebase(&content, &paths::base(&source.path), name)
            .map_err(TransferError::archive(&source.path))?,
        None => content,
    };
    let destination = host_destination_info(dest_path)?;
    let (dir, content) = prepare_copy(content, source, &destination)?;
    archive::unpack(&content, Path::new(&dir)).map_err(TransferError::archive(&dir))
}

async fn run_blocking<T, F>(work: F) -> Result<T, TransferError>
where
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| TransferError::Archive {
            path: String::new(),
            source: io::Error::new(io::ErrorKind::Other, err),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn info(path: &str, exists: bool, is_dir: bool) -> CopyInfo {
        CopyInfo {
            path: path.to_string(),
            exists,
            is_dir,
            rebase_name: None,
        }
    }

    #[test]
    fn test_expand_glob_does_not_cross_separators() {
        let tmp = tempdir().unwrap();
        fs::create_dir(tmp.path().join("nested")).unwrap();
        fs::write(tmp.path().join("a.yml"), "").unwrap();
        fs::write(tmp.path().join("b.yml"), "").unwrap();
        fs::write(tmp.path().join("c.txt"), "").unwrap();
        fs::write(tmp.path().join("nested").join("d.yml"), "").unwrap();

        let base = tmp.path().to_string_lossy().into_owned();
        let matches = expand_glob(&format!("{}/*.yml", base)).unwrap();
        assert_eq!(matches, vec![format!("{}/a.yml", base), format!("{}/b.yml", base)]);

        let nested = expand_glob(&format!("{}/*/*.yml", base)).unwrap();
        assert_eq!(nested, vec![format!("{}/nested/d.yml", base)]);
    }

    #[test]
    fn test_expand_glob_without_meta_checks_existence() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("VERSION");
        fs::write(&file, "1").unwrap();
        let path = file.to_string_lossy().into_owned();
        assert_eq!(expand_glob(&path).unwrap(), vec![path.clone()]);
        assert!(expand_glob(&format!("{}.missing", path)).unwrap().is_empty());
    }

    #[test]
    fn test_expand_glob_treats_braces_literally() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), "").unwrap();
        fs::write(tmp.path().join("b.txt"), "").unwrap();
        fs::write(tmp.path().join("{a,b}.txt"), "").unwrap();

        let base = tmp.path().to_string_lossy().into_owned();
        let matches = expand_glob(&format!("{}/{{a,b}}*", base)).unwrap();
        assert_eq!(matches, vec![format!("{}/{{a,b}}.txt", base)]);
    }

    #[test]
    fn test_literal_braces_leaves_classes_alone() {
        assert_eq!(literal_braces("*.{yml,yaml}"), "*.[{]yml,yaml[}]");
        assert_eq!(literal_braces("[{}]x"), "[{}]x");
    }

    #[test]
    fn test_prepare_copy_into_existing_directory() {
        let (dir, _) = prepare_copy(Vec::new(), &info("/host/a.txt", true, false), &info("/src", true, true)).unwrap();
        assert_eq!(dir, "/src");
    }

    #[test]
    fn test_prepare_copy_directory_onto_file_fails() {
        let err = prepare_copy(Vec::new(), &info("/host/dir", true, true), &info("/src/file", true, false)).unwrap_err();
        assert!(matches!(err, TransferError::CannotCopyDir(_)));
    }

    #[test]
    fn test_prepare_copy_file_to_asserted_missing_directory_fails() {
        let err = prepare_copy(Vec::new(), &info("/host/a.txt", true, false), &info("/out/new/", false, false)).unwrap_err();
        assert!(matches!(err, TransferError::DirNotExists(_)));
    }

    #[test]
    fn test_prepare_copy_renames_to_new_file() {
        let content = archive::single_file("a.txt", b"x", 0).unwrap();
        let (dir, content) =
            prepare_copy(content, &info("/src/a.txt", true, false), &info("/out/b.txt", false, false)).unwrap();
        assert_eq!(dir, "/out");
        let mut archive = tar::Archive::new(&content[..]);
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "b.txt");
    }

    #[test]
    fn test_host_destination_info() {
        let tmp = tempdir().unwrap();
        let base = tmp.path().to_string_lossy().into_owned();

        let existing = host_destination_info(&base).unwrap();
        assert!(existing.exists && existing.is_dir);

        let missing = host_destination_info(&format!("{}/new.txt", base)).unwrap();
        assert!(!missing.exists);

        assert!(host_destination_info(&format!("{}/no/such/file", base)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_host_destination_symlink_loop() {
        let tmp = tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::os::unix::fs::symlink(&b, &a).unwrap();
        std::os::unix::fs::symlink(&a, &b).unwrap();
        let err = host_destination_info(&a.to_string_lossy()).unwrap_err();
        assert!(matches!(err, TransferError::TooManySymlinks(_)));
    }

    #[test]
    fn test_validate_output_path() {
        let tmp = tempdir().unwrap();
        let base = tmp.path().to_string_lossy().into_owned();
        assert!(validate_output_path(&format!("{}/out.txt", base)).is_ok());
        assert!(validate_output_path(&format!("{}/missing/out.txt", base)).is_err());
        assert!(validate_output_path(&format!("{}/newdir/", base)).is_err());
    }
}
