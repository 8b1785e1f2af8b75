//! Pure name/path validation rules. No I/O, no state — every function here
//! is a decision, not an action.

const MAX_FOLDER_DEPTH: usize = 5;
const MAX_SITE_NAME_LEN: usize = 63;
const MAX_UPLOAD_NAME_LEN: usize = 255;

const WINDOWS_RESERVED: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

// Full-width punctuation the server is known to sanitize out of upload names.
const BLOCKED_FULLWIDTH: &[char] = &[
    '\u{FF01}', '\u{FF1F}', '\u{FF0C}', '\u{FF0E}', '\u{FF1A}', '\u{FF1B}',
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl Validation {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

fn is_windows_reserved(stem: &str) -> bool {
    WINDOWS_RESERVED.contains(&stem.to_ascii_lowercase().as_str())
}

fn has_consecutive_hyphens(s: &str) -> bool {
    s.as_bytes().windows(2).any(|w| w[0] == b'-' && w[1] == b'-')
}

/// Validates a site file's base name, e.g. `intro` from `intro.html`.
/// Callers strip the trailing `.html` before invoking this.
pub fn validate_site_name(name: &str) -> Validation {
    if name.is_empty() {
        return Validation::fail("name is empty");
    }
    if name.len() > MAX_SITE_NAME_LEN {
        return Validation::fail(format!("name exceeds {MAX_SITE_NAME_LEN} characters"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Validation::fail("name contains characters other than A-Z, a-z, 0-9, -");
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Validation::fail("name has a leading or trailing hyphen");
    }
    if has_consecutive_hyphens(name) {
        return Validation::fail("name has consecutive hyphens");
    }
    if is_windows_reserved(name) {
        return Validation::fail("name is a reserved Windows device name");
    }
    Validation::ok()
}

/// Validates an upload file's base name (including extension). More
/// permissive than the site validator, but blocks control characters, path
/// separators, trailing dots, and known sanitized punctuation.
pub fn validate_upload_name(name: &str) -> Validation {
    if name.is_empty() {
        return Validation::fail("name is empty");
    }
    if name.as_bytes().len() > MAX_UPLOAD_NAME_LEN {
        return Validation::fail(format!("name exceeds {MAX_UPLOAD_NAME_LEN} bytes"));
    }
    if name.chars().any(|c| c.is_control()) {
        return Validation::fail("name contains control characters");
    }
    if name.contains('/') || name.contains('\\') {
        return Validation::fail("name contains a path separator");
    }
    if name.ends_with('.') {
        return Validation::fail("name ends with a dot");
    }
    if name.chars().any(|c| BLOCKED_FULLWIDTH.contains(&c)) {
        return Validation::fail("name contains disallowed full-width punctuation");
    }
    let stem = name.split('.').next().unwrap_or(name);
    if is_windows_reserved(stem) {
        return Validation::fail("name is a reserved Windows device name");
    }
    Validation::ok()
}

/// Validates a single folder path segment.
pub fn validate_folder_segment(segment: &str) -> Validation {
    if segment.is_empty() {
        return Validation::fail("folder segment is empty");
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Validation::fail("folder segment contains characters other than a-z, 0-9, _, -");
    }
    Validation::ok()
}

fn split_relative_path(rel_path: &str) -> Vec<&str> {
    rel_path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Validates a full relative path to a site file: every folder segment,
/// the depth limit, and the base name (with `.html` stripped).
pub fn validate_site_path(rel_path: &str) -> Validation {
    let parts = split_relative_path(rel_path);
    let Some((name_part, folders)) = parts.split_last() else {
        return Validation::fail("path is empty");
    };
    if folders.len() > MAX_FOLDER_DEPTH {
        return Validation::fail(format!("folder depth exceeds {MAX_FOLDER_DEPTH}"));
    }
    for segment in folders {
        let v = validate_folder_segment(segment);
        if !v.valid {
            return v;
        }
    }
    let stem = name_part.strip_suffix(".html").unwrap_or(name_part);
    if stem == *name_part {
        return Validation::fail("site file must have a .html extension");
    }
    validate_site_name(stem)
}

/// Validates a full relative path to an upload file: folder rules, depth
/// limit, name rules, and the size cap.
pub fn validate_upload_path(rel_path: &str, size_bytes: u64) -> Validation {
    const MAX_UPLOAD_SIZE: u64 = 10 * 1024 * 1024;

    let parts = split_relative_path(rel_path);
    let Some((name_part, folders)) = parts.split_last() else {
        return Validation::fail("path is empty");
    };
    if folders.len() > MAX_FOLDER_DEPTH {
        return Validation::fail(format!("folder depth exceeds {MAX_FOLDER_DEPTH}"));
    }
    for segment in folders {
        let v = validate_folder_segment(segment);
        if !v.valid {
            return v;
        }
    }
    let name_validation = validate_upload_name(name_part);
    if !name_validation.valid {
        return name_validation;
    }
    if size_bytes > MAX_UPLOAD_SIZE {
        return Validation::fail(format!("size exceeds {MAX_UPLOAD_SIZE} bytes"));
    }
    Validation::ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_site_name() {
        assert!(validate_site_name("intro").valid);
    }

    #[test]
    fn rejects_leading_trailing_and_consecutive_hyphens() {
        assert!(!validate_site_name("-intro").valid);
        assert!(!validate_site_name("intro-").valid);
        assert!(!validate_site_name("in--tro").valid);
    }

    #[test]
    fn rejects_windows_reserved_names() {
        assert!(!validate_site_name("con").valid);
        assert!(!validate_site_name("COM1").valid);
    }

    #[test]
    fn validates_nested_site_path_and_depth() {
        assert!(validate_site_path("blog/intro.html").valid);
        let deep = "a/b/c/d/e/f/name.html";
        assert!(!validate_site_path(deep).valid);
    }

    #[test]
    fn requires_html_extension_for_sites() {
        assert!(!validate_site_path("blog/intro").valid);
    }

    #[test]
    fn upload_name_rejects_path_separators_and_trailing_dot() {
        assert!(!validate_upload_name("a/b.png").valid);
        assert!(!validate_upload_name("file.").valid);
    }

    #[test]
    fn upload_path_enforces_size_limit() {
        let ok = validate_upload_path("assets/photo.png", 1024);
        assert!(ok.valid);
        let too_big = validate_upload_path("assets/photo.png", 11 * 1024 * 1024);
        assert!(!too_big.valid);
    }
}
