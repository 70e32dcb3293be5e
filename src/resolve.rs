#![forbid(unsafe_code)]

//! File-identity resolution.
//!
//! The download tool reports a logical title and sometimes an exact output
//! path, but post-processing changes extensions and filename sanitization
//! rewrites special characters, so the literal expected path frequently does
//! not exist. This module maps an adapter entry back to the real file on
//! disk through an ordered fallback chain; a record is only ever created for
//! a path that was found here.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Locates the on-disk file for one logical entry.
///
/// Fallback chain, first match wins:
/// 1. the exact path the adapter reported, if it exists;
/// 2. sanitized title plus the format policy's target extension;
/// 3. newest file whose name starts with the sanitized title;
/// 4. newest file whose name starts with the raw title.
///
/// Returns `None` when every step misses; the caller skips the entry.
pub fn resolve_entry(
    media_dir: &Path,
    reported: Option<&Path>,
    title: &str,
    target_ext: &str,
) -> Option<PathBuf> {
    if let Some(path) = reported
        && path.is_file()
    {
        return Some(path.to_path_buf());
    }

    let sanitized = sanitize_title(title);
    let expected = media_dir.join(format!("{sanitized}.{target_ext}"));
    if expected.is_file() {
        return Some(expected);
    }

    if let Some(found) = newest_with_prefix(media_dir, &sanitized) {
        return Some(found);
    }

    newest_with_prefix(media_dir, title)
}

/// Applies the download tool's restricted-filenames rewrite to a title so the
/// expected-path and prefix steps agree with what it actually wrote to disk.
///
/// Mirrors the restricted mode: accents fold to ASCII, `?` `"` and control
/// characters disappear, `:` becomes `_-`, path separators, shell
/// metacharacters, whitespace and any remaining non-ASCII become `_`, then
/// runs of `_` collapse and leftover edge characters are trimmed.
pub fn sanitize_title(title: &str) -> String {
    let mut raw = String::with_capacity(title.len());
    for ch in title.chars() {
        if let Some(folded) = fold_accent(ch) {
            raw.push_str(folded);
            continue;
        }
        match ch {
            '?' | '"' => {}
            c if (c as u32) < 32 || c as u32 == 127 => {}
            ':' => raw.push_str("_-"),
            '\\' | '/' | '|' | '*' | '<' | '>' => raw.push('_'),
            c if "!&'()[]{}$;`^,#".contains(c) || c.is_whitespace() => raw.push('_'),
            c if !c.is_ascii() => raw.push('_'),
            c => raw.push(c),
        }
    }

    let mut collapsed = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(ch);
    }

    let trimmed = collapsed.trim_matches('_');
    let trimmed = trimmed.strip_prefix("-_").unwrap_or(trimmed);
    let mut result = if let Some(rest) = trimmed.strip_prefix('-') {
        format!("_{rest}")
    } else {
        trimmed.to_string()
    };
    result = result.trim_start_matches('.').to_string();
    if result.is_empty() {
        result.push('_');
    }
    result
}

fn fold_accent(c: char) -> Option<&'static str> {
    Some(match c {
        'Â' | 'Ã' | 'Ä' | 'À' | 'Á' | 'Å' => "A",
        'Æ' => "AE",
        'Ç' => "C",
        'È' | 'É' | 'Ê' | 'Ë' => "E",
        'Ì' | 'Í' | 'Î' | 'Ï' => "I",
        'Ð' => "D",
        'Ñ' => "N",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ő' | 'Ø' => "O",
        'Œ' => "OE",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ű' => "U",
        'Ý' => "Y",
        'Þ' => "P",
        'ß' => "ss",
        'â' | 'ã' | 'ä' | 'à' | 'á' | 'å' => "a",
        'æ' => "ae",
        'ç' => "c",
        'è' | 'é' | 'ê' | 'ë' => "e",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'ð' => "d",
        'ñ' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ő' | 'ø' => "o",
        'œ' => "oe",
        'ù' | 'ú' | 'û' | 'ü' | 'ű' => "u",
        'ý' | 'ÿ' => "y",
        'þ' => "p",
        _ => return None,
    })
}

/// Newest regular file in `media_dir` whose name starts with `prefix`,
/// by creation time where the filesystem reports one, otherwise mtime.
fn newest_with_prefix(media_dir: &Path, prefix: &str) -> Option<PathBuf> {
    if prefix.is_empty() {
        // An empty prefix would match the entire directory.
        return None;
    }
    let entries = fs::read_dir(media_dir).ok()?;
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let stamp = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().map_or(true, |(newest, _)| stamp > *newest) {
            best = Some((stamp, path));
        }
    }
    best.map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        writeln!(file, "media").unwrap();
        path
    }

    #[test]
    fn sanitize_rewrites_like_restricted_mode() {
        assert_eq!(sanitize_title("My Song!"), "My_Song");
        assert_eq!(sanitize_title("AC/DC: Live!"), "AC_DC_-_Live");
        assert_eq!(sanitize_title("Café Déjà Vu"), "Cafe_Deja_Vu");
        assert_eq!(sanitize_title("Who? Me."), "Who_Me.");
        assert_eq!(sanitize_title("a  b"), "a_b");
        assert_eq!(sanitize_title("plain-name_1.0"), "plain-name_1.0");
    }

    #[test]
    fn sanitize_handles_degenerate_titles() {
        assert_eq!(sanitize_title(""), "_");
        assert_eq!(sanitize_title("???"), "_");
        assert_eq!(sanitize_title("-intro"), "_intro");
        assert_eq!(sanitize_title("...hidden"), "hidden");
    }

    #[test]
    fn reported_path_short_circuits_the_chain() {
        let dir = tempdir().unwrap();
        let reported = touch(dir.path(), "odd name (1).mp3");
        // A sanitized-title candidate also exists; step 1 must still win.
        touch(dir.path(), "My_Song.mp3");

        let resolved = resolve_entry(dir.path(), Some(&reported), "My Song!", "mp3").unwrap();
        assert_eq!(resolved, reported);
    }

    #[test]
    fn missing_reported_path_falls_through() {
        let dir = tempdir().unwrap();
        let expected = touch(dir.path(), "My_Song.mp3");
        let ghost = dir.path().join("gone.mp3");

        let resolved = resolve_entry(dir.path(), Some(&ghost), "My Song!", "mp3").unwrap();
        assert_eq!(resolved, expected);
    }

    #[test]
    fn expected_path_from_sanitized_title_and_extension() {
        let dir = tempdir().unwrap();
        let expected = touch(dir.path(), "My_Song.mp3");

        let resolved = resolve_entry(dir.path(), None, "My Song!", "mp3").unwrap();
        assert_eq!(resolved, expected);
        assert_eq!(resolved.file_name().unwrap(), "My_Song.mp3");
    }

    #[test]
    fn sanitized_prefix_scan_finds_renamed_output() {
        let dir = tempdir().unwrap();
        // Post-processing appended a qualifier, so the exact expected path
        // does not exist and the prefix step has to find the file.
        let produced = touch(dir.path(), "My_Song_Official_Video.mp3");

        let resolved = resolve_entry(dir.path(), None, "My Song!", "mp3").unwrap();
        assert_eq!(resolved, produced);
    }

    #[test]
    fn prefix_scan_takes_most_recently_created() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "My_Song_old.mp3");
        sleep(Duration::from_millis(50));
        let newer = touch(dir.path(), "My_Song_new.mp3");

        let resolved = resolve_entry(dir.path(), None, "My Song!", "mp3").unwrap();
        assert_eq!(resolved, newer);
    }

    #[test]
    fn raw_title_prefix_is_the_last_resort() {
        let dir = tempdir().unwrap();
        let produced = touch(dir.path(), "My Song! (Live).mp3");

        let resolved = resolve_entry(dir.path(), None, "My Song!", "mp3").unwrap();
        assert_eq!(resolved, produced);
    }

    #[test]
    fn sanitized_prefix_wins_over_raw_prefix() {
        let dir = tempdir().unwrap();
        let sanitized_match = touch(dir.path(), "My_Song_v2.mp3");
        sleep(Duration::from_millis(50));
        // Even a newer raw-title match must not shadow the earlier chain step.
        touch(dir.path(), "My Song! (Live).mp3");

        let resolved = resolve_entry(dir.path(), None, "My Song!", "mp3").unwrap();
        assert_eq!(resolved, sanitized_match);
    }

    #[test]
    fn unresolvable_entry_returns_none() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "unrelated.mp3");
        assert!(resolve_entry(dir.path(), None, "My Song!", "mp3").is_none());
    }

    #[test]
    fn directories_never_resolve() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("My_Song.mp3")).unwrap();
        assert!(resolve_entry(dir.path(), None, "My Song!", "mp3").is_none());
    }
}
