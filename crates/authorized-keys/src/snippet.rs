use crate::{AuthorizedKeysError, Result};
use sshkey_protocol::{UserRecord, UserRecordList};
use std::fmt::Write;

pub const BEGIN_MARKER: &str = "# BEGIN: github_sshkey_provider";
pub const END_MARKER: &str = "# END: github_sshkey_provider";

/// Renders the managed block for `records`, markers included.
///
/// Output is a pure function of the input: records keep their order and the
/// same list always yields the same bytes, which is what lets the merge step
/// detect no-op updates.
pub fn render(records: &UserRecordList) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "{BEGIN_MARKER}")?;
    for record in records {
        render_record(&mut out, record)?;
    }
    writeln!(out, "{END_MARKER}")?;
    Ok(out)
}

fn render_record(out: &mut String, record: &UserRecord) -> Result<()> {
    writeln!(
        out,
        "# SSH keys for {} ({})",
        single_line(&record.login),
        single_line(record.name_or_placeholder())
    )?;

    let keys = record.keys.trim_end_matches(['\r', '\n']);
    for line in keys.lines() {
        if is_marker(line) {
            return Err(AuthorizedKeysError::MarkerInContent {
                login: record.login.clone(),
            });
        }
        writeln!(out, "{line}")?;
    }
    out.push('\n');
    Ok(())
}

// Header fields come from the directory service; a newline there would let a
// display name inject arbitrary lines into the file.
fn single_line(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

pub(crate) fn is_marker(line: &str) -> bool {
    line == BEGIN_MARKER || line == END_MARKER
}
