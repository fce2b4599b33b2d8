use crate::error::MalformedReason;
use crate::snippet::{BEGIN_MARKER, END_MARKER};
use crate::{AuthorizedKeysError, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

const TEMP_SUFFIX: &str = ".sshkey-provider.tmp";

/// What to do when the target file does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingFilePolicy {
    /// Treat the file as empty and create it on the first write.
    #[default]
    Create,
    /// Refuse to update; the operator is expected to provision the file.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Begin,
    End,
}

fn classify(line: &[u8]) -> Option<Marker> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line == BEGIN_MARKER.as_bytes() {
        Some(Marker::Begin)
    } else if line == END_MARKER.as_bytes() {
        Some(Marker::End)
    } else {
        None
    }
}

fn validate_snippet(snippet: &str) -> Result<()> {
    let mut lines = snippet.trim_end_matches(['\r', '\n']).lines();
    if lines.next() != Some(BEGIN_MARKER) {
        return Err(AuthorizedKeysError::InvalidSnippet(
            "snippet must start with the begin marker".to_string(),
        ));
    }
    if lines.next_back() != Some(END_MARKER) {
        return Err(AuthorizedKeysError::InvalidSnippet(
            "snippet must end with the end marker".to_string(),
        ));
    }
    if lines.any(crate::snippet::is_marker) {
        return Err(AuthorizedKeysError::InvalidSnippet(
            "snippet contains a nested marker".to_string(),
        ));
    }
    Ok(())
}

/// Replaces the managed block of `existing` with `snippet`.
///
/// Lines outside the markers are kept byte-for-byte and in order. The snippet
/// takes the place of the first managed block; when the file has none it is
/// appended after a blank separator line. A begin marker with no end marker
/// swallows the rest of the file.
pub fn merge(existing: &[u8], snippet: &str) -> Result<Vec<u8>> {
    validate_snippet(snippet)?;

    let mut block = snippet.as_bytes().to_vec();
    if !block.ends_with(b"\n") {
        block.push(b'\n');
    }

    let mut out = Vec::with_capacity(existing.len() + block.len() + 1);
    let mut inside = false;
    let mut inserted = false;

    for (idx, line) in existing.split_inclusive(|b| *b == b'\n').enumerate() {
        match classify(line) {
            Some(Marker::Begin) => {
                if inside {
                    return Err(AuthorizedKeysError::Malformed {
                        line: idx + 1,
                        reason: MalformedReason::NestedBegin,
                    });
                }
                inside = true;
                if !inserted {
                    out.extend_from_slice(&block);
                    inserted = true;
                }
            }
            Some(Marker::End) => {
                if !inside {
                    return Err(AuthorizedKeysError::Malformed {
                        line: idx + 1,
                        reason: MalformedReason::UnmatchedEnd,
                    });
                }
                inside = false;
            }
            None if !inside => out.extend_from_slice(line),
            None => {}
        }
    }

    if inside {
        log::warn!("managed block is not terminated; content after the begin marker was dropped");
    }

    if !inserted {
        if !out.is_empty() {
            if !out.ends_with(b"\n") {
                out.push(b'\n');
            }
            out.push(b'\n');
        }
        out.extend_from_slice(&block);
    }

    Ok(out)
}

/// Rewrites the managed block of the file at `path`.
///
/// Returns [`UpdateOutcome::NotChanged`] without touching the file when the
/// merged content is byte-identical to what is on disk. A malformed file is
/// never written.
pub fn update(path: &Path, snippet: &str, missing: MissingFilePolicy) -> Result<UpdateOutcome> {
    let existing = match fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => match missing {
            MissingFilePolicy::Create => None,
            MissingFilePolicy::Error => {
                return Err(AuthorizedKeysError::MissingFile(path.to_path_buf()))
            }
        },
        Err(err) => return Err(err.into()),
    };

    let merged = merge(existing.as_deref().unwrap_or_default(), snippet)?;
    if existing.as_deref() == Some(merged.as_slice()) {
        log::debug!("{} already up to date", path.display());
        return Ok(UpdateOutcome::NotChanged);
    }

    write_atomic(path, &merged)?;
    log::info!("Updated {} ({} bytes)", path.display(), merged.len());
    Ok(UpdateOutcome::Updated)
}

fn target_dir(path: &Path) -> Result<(&Path, String)> {
    let file_name = path
        .file_name()
        .ok_or_else(|| AuthorizedKeysError::InvalidPath(path.to_path_buf()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((dir, format!(".{}.", file_name.to_string_lossy())))
}

// The file holds key material: create it owner-only and swap it in with a
// rename so sshd never reads a half-written file.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let (dir, prefix) = target_dir(path)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    // an unpersisted temp file is removed on drop
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
