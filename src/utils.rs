//! Utility functions for path mapping, hashing and archive naming

use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Characters that are not allowed in local file or folder names
const INVALID_PATH_CHARS: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];

/// Upper bound on decode passes, enough for any realistic nesting
const MAX_DECODE_PASSES: usize = 8;

/// Percent-decode a string until it no longer changes
///
/// Index front-ends sometimes double or triple encode path segments.
///
/// # Examples
///
/// ```
/// use index_mirror::utils::decode_until_stable;
///
/// assert_eq!(decode_until_stable("Show%2520Name"), "Show Name");
/// assert_eq!(decode_until_stable("plain"), "plain");
/// ```
#[must_use]
pub fn decode_until_stable(input: &str) -> String {
    let mut current = input.to_string();
    for _ in 0..MAX_DECODE_PASSES {
        let next = match urlencoding::decode(&current) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(current.as_bytes()))
                .into_owned(),
        };
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Remove characters that cannot appear in local file names
#[must_use]
pub fn strip_invalid_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !INVALID_PATH_CHARS.contains(c) && !c.is_control())
        .collect()
}

/// Map a remote (possibly encoded) path to a safe relative local path
///
/// Each segment is decoded and stripped of invalid characters. Empty, `.` and
/// `..` segments are dropped, so the result never escapes its base folder.
///
/// # Examples
///
/// ```
/// use index_mirror::utils::remote_to_relative_path;
/// use std::path::PathBuf;
///
/// assert_eq!(
///     remote_to_relative_path("/Series/Show%20%3A%20S01/../ep.rar"),
///     PathBuf::from("Series/Show  S01/ep.rar")
/// );
/// ```
#[must_use]
pub fn remote_to_relative_path(remote: &str) -> PathBuf {
    let decoded = decode_until_stable(remote);
    decoded
        .split(['/', '\\'])
        .map(|segment| strip_invalid_chars(segment).trim().to_string())
        .filter(|segment| !segment.is_empty() && segment != "." && segment != "..")
        .collect()
}

/// Compute the MD5 of a file as lowercase hex
///
/// Blocking; call from `spawn_blocking` in async contexts.
pub fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Human readable size (`1.50 MB`)
///
/// # Examples
///
/// ```
/// use index_mirror::utils::format_size;
///
/// assert_eq!(format_size(512), "512.00 B");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

fn volume_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // `name.part01.rar`, `name.part1.rar`, `name.parte2.rar`
    RE.get_or_init(|| Regex::new(r"(?i)^(?P<stem>.+)\.parte?(?P<num>\d{1,3})\.rar$").ok())
        .as_ref()
}

/// A volume of a multi-volume RAR set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeName {
    /// Set name shared by all volumes (`name` in `name.part01.rar`)
    pub stem: String,
    /// Volume number, starting at 1
    pub number: u32,
}

/// Parse a multi-volume RAR file name
///
/// # Examples
///
/// ```
/// use index_mirror::utils::parse_volume_name;
///
/// let v = parse_volume_name("Show.S01.part02.rar").unwrap();
/// assert_eq!(v.stem, "Show.S01");
/// assert_eq!(v.number, 2);
/// assert!(parse_volume_name("Show.S01.rar").is_none());
/// ```
#[must_use]
pub fn parse_volume_name(file_name: &str) -> Option<VolumeName> {
    let caps = volume_regex()?.captures(file_name)?;
    let number = caps.name("num")?.as_str().parse().ok()?;
    Some(VolumeName {
        stem: caps.name("stem")?.as_str().to_string(),
        number,
    })
}

/// Whether a file name is one volume of a multi-volume RAR set
#[must_use]
pub fn is_multivolume(file_name: &str) -> bool {
    parse_volume_name(file_name).is_some()
}

/// Name of the directory an archive is extracted into with `--extract-subdir`
///
/// Volume suffixes are dropped so every volume of a set maps to one folder.
#[must_use]
pub fn archive_stem(file_name: &str) -> String {
    if let Some(volume) = parse_volume_name(file_name) {
        return volume.stem;
    }
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}
