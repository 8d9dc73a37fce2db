//! Target filename derivation.

use std::path::{Path, PathBuf};

use crate::models::Rendition;

const FALLBACK_NAME: &str = "download";
const MAX_STEM_LEN: usize = 180;

/// Reduce a media title to a portable filename stem: ASCII letters, digits,
/// `-`, `_` and `.` survive, whitespace becomes `_`, everything else is dropped.
pub fn restricted_filename(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        match c {
            c if c.is_ascii_alphanumeric() || c == '-' || c == '.' => out.push(c),
            c if c == '_' || c.is_whitespace() => {
                if !out.ends_with('_') {
                    out.push('_');
                }
            }
            _ => {}
        }
    }

    // Leading dots would hide the file and ".." must never survive as a name.
    let trimmed = out.trim_matches(|c| c == '_' || c == '.');
    let mut stem: String = trimmed.chars().take(MAX_STEM_LEN).collect();
    if stem.is_empty() {
        stem.push_str(FALLBACK_NAME);
    }
    stem
}

/// `<dir>/<restricted title>.<container>` for a resolved rendition.
pub fn target_path(dir: &Path, title: &str, rendition: &Rendition) -> PathBuf {
    let ext = restricted_filename(&rendition.container);
    dir.join(format!("{}.{}", restricted_filename(title), ext))
}
