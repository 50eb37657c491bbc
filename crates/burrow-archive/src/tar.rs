//! Streaming tar archive and safe extraction
//!
//! Archives a single file or a directory tree, rooted at the basename of the
//! source path. Deterministic mode zeroes timestamps and ownership and sorts
//! entries so identical trees produce identical archives. Extraction rejects
//! any entry whose normalized path would escape the destination root.

use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use burrow_core::{BurrowError, BurrowResult};

#[derive(Debug, Clone, Default)]
pub struct TarOptions {
    /// Emit a header for the top-level directory itself.
    pub include_root: bool,
    /// Zero timestamps/uid/gid/owner names and sort entries by archive path.
    pub deterministic: bool,
    /// Glob patterns matched against the slash-normalized archive path and
    /// against the basename. `*` and `?` stay within one path segment;
    /// `**/x` and `x/**` span directories.
    pub exclude: Vec<String>,
    /// Dereference symlinks that point at regular files.
    pub follow_symlinks: bool,
}

struct PlannedEntry {
    full: PathBuf,
    name: String,
    meta: fs::Metadata,
}

/// Write a tar archive of `src_path` into `w`.
pub fn stream_tar(w: &mut dyn Write, src_path: &Path, opts: &TarOptions) -> BurrowResult<()> {
    let root_name = src_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_owned());

    let meta = fs::symlink_metadata(src_path)
        .map_err(|e| BurrowError::InvalidInput(format!("stat {}: {e}", src_path.display())))?;

    let mut entries: Vec<PlannedEntry> = Vec::new();

    if meta.is_dir() {
        if opts.include_root && !excluded(&root_name, &opts.exclude) {
            entries.push(PlannedEntry {
                full: src_path.to_path_buf(),
                name: root_name.clone(),
                meta: meta.clone(),
            });
        }
        collect_dir(src_path, &root_name, opts, &mut entries)?;
    } else if meta.is_file() || meta.file_type().is_symlink() {
        if !excluded(&root_name, &opts.exclude) {
            entries.push(PlannedEntry {
                full: src_path.to_path_buf(),
                name: root_name,
                meta,
            });
        }
    } else {
        return Err(BurrowError::InvalidInput(format!(
            "unsupported file type: {}",
            src_path.display()
        )));
    }

    if opts.deterministic {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
    }

    let mut builder = tar::Builder::new(w);
    builder.follow_symlinks(false);
    for entry in entries {
        append_entry(&mut builder, &entry, opts)?;
    }
    builder.finish()?;
    Ok(())
}

fn collect_dir(
    dir: &Path,
    prefix: &str,
    opts: &TarOptions,
    entries: &mut Vec<PlannedEntry>,
) -> BurrowResult<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|d| d.file_name());

    for child in children {
        let full = child.path();
        let name = format!(
            "{prefix}/{}",
            child.file_name().to_string_lossy()
        );
        if excluded(&name, &opts.exclude) {
            continue;
        }

        let meta = fs::symlink_metadata(&full)?;
        if meta.is_dir() {
            entries.push(PlannedEntry {
                full: full.clone(),
                name: name.clone(),
                meta,
            });
            collect_dir(&full, &name, opts, entries)?;
        } else if meta.is_file() || meta.file_type().is_symlink() {
            entries.push(PlannedEntry { full, name, meta });
        }
        // Sockets, FIFOs, and devices are skipped.
    }
    Ok(())
}

fn append_entry(
    builder: &mut tar::Builder<&mut dyn Write>,
    entry: &PlannedEntry,
    opts: &TarOptions,
) -> BurrowResult<()> {
    let file_type = entry.meta.file_type();

    let mut header = tar::Header::new_gnu();
    apply_metadata(&mut header, &entry.meta, opts);

    if file_type.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, format!("{}/", entry.name), std::io::empty())?;
    } else if file_type.is_file() {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(entry.meta.len());
        let file = fs::File::open(&entry.full)?;
        builder.append_data(&mut header, &entry.name, file)?;
    } else if file_type.is_symlink() {
        let target = fs::read_link(&entry.full)?;
        if opts.follow_symlinks {
            if let Ok(resolved) = fs::metadata(&entry.full) {
                if resolved.is_file() {
                    let mut header = tar::Header::new_gnu();
                    apply_metadata(&mut header, &resolved, opts);
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(resolved.len());
                    let file = fs::File::open(&entry.full)?;
                    builder.append_data(&mut header, &entry.name, file)?;
                    return Ok(());
                }
            }
        }
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, &entry.name, &target)?;
    }
    Ok(())
}

fn apply_metadata(header: &mut tar::Header, meta: &fs::Metadata, opts: &TarOptions) {
    // Only permission bits; no setuid/setgid/sticky.
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        header.set_mode(meta.mode() & 0o777);
    }
    #[cfg(not(unix))]
    header.set_mode(if meta.is_dir() { 0o755 } else { 0o644 });

    if opts.deterministic {
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
    } else {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        header.set_mtime(mtime);
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            header.set_uid(meta.uid() as u64);
            header.set_gid(meta.gid() as u64);
        }
    }
}

/// Extract a tar stream into `dest_dir`, rejecting entries that escape it.
pub fn extract_tar(r: &mut dyn Read, dest_dir: &Path) -> BurrowResult<()> {
    fs::create_dir_all(dest_dir)?;

    let mut archive = tar::Archive::new(r);
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if escapes_root(&path) {
            return Err(BurrowError::Format(format!(
                "illegal path in archive: {}",
                path.display()
            )));
        }
        // unpack_in re-validates and handles dirs, files, and links.
        let _ = entry.unpack_in(dest_dir)?;
    }
    Ok(())
}

/// True when the normalized path starts above the extraction root.
fn escapes_root(path: &Path) -> bool {
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }
    false
}

fn excluded(name: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let base = name.rsplit('/').next().unwrap_or(name);
    patterns.iter().any(|p| {
        let p = p.trim();
        !p.is_empty() && (glob_match(p, name) || glob_match(p, base))
    })
}

/// Minimal glob matching: `*` and `?` within one segment, with `**/x` and
/// `x/**` expanding to suffix/prefix spans across directories.
fn glob_match(pattern: &str, s: &str) -> bool {
    if let Some(rest) = pattern.strip_prefix("**/") {
        if !rest.contains(['*', '?']) && s.ends_with(rest) {
            return true;
        }
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        if s.starts_with(prefix) {
            return true;
        }
    }
    segment_match(pattern.as_bytes(), s.as_bytes())
}

fn segment_match(pattern: &[u8], s: &[u8]) -> bool {
    match (pattern.first(), s.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            // `*` never crosses a path separator.
            segment_match(&pattern[1..], s)
                || (!s.is_empty() && s[0] != b'/' && segment_match(pattern, &s[1..]))
        }
        (Some(b'?'), Some(&c)) if c != b'/' => segment_match(&pattern[1..], &s[1..]),
        (Some(&p), Some(&c)) if p == c => segment_match(&pattern[1..], &s[1..]),
        _ => false,
    }
}
