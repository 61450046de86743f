//! Transcript parser for `nomad-pack render` output.
//!
//! The renderer prints each file as a bold `name:` heading followed by the
//! file body. Bold headings are the only structure in the transcript, so
//! they are used as file boundaries.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::{PackFsError, PackFsResult};

/// Start of bold text.
pub const BOLD_START: &str = "\x1b[1m";
/// Reset of all attributes, which ends bold text.
pub const BOLD_END: &str = "\x1b[0m";

static BOLD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[1m(.*?)\x1b\[0m").expect("valid bold regex"));

/// Rendered files of one job, file name to content.
pub type JobFiles = BTreeMap<String, String>;

/// Split a transcript into files.
///
/// Every bold span names a file; its content is everything up to the next
/// bold span (or the end), trimmed and terminated with a single newline.
/// A trailing `:` on the name is display decoration and is dropped. When a
/// name repeats, the last occurrence wins.
///
/// Returns [`PackFsError::Parse`] when the transcript has no bold spans.
pub fn parse_rendered_output(output: &str) -> PackFsResult<JobFiles> {
    // (marker start, marker end, enclosed text)
    let markers: Vec<(usize, usize, &str)> = BOLD_RE
        .captures_iter(output)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(1)?;
            Some((whole.start(), whole.end(), name.as_str()))
        })
        .collect();
    if markers.is_empty() {
        return Err(PackFsError::Parse);
    }

    let mut files = JobFiles::new();
    for (i, &(marker_start, start, raw_name)) in markers.iter().enumerate() {
        let name = raw_name.strip_suffix(':').unwrap_or(raw_name);
        if name.is_empty() {
            debug!(offset = marker_start, "skipping bold span without a name");
            continue;
        }

        let end = markers.get(i + 1).map_or(output.len(), |next| next.0);
        let mut content = output[start..end].trim().to_string();
        content.push('\n');
        files.insert(name.to_string(), content);
    }

    Ok(files)
}
