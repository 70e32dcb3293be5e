#![forbid(unsafe_code)]

//! Security helpers for the MediaVault server.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. Running as a regular
/// unprivileged user keeps local installs predictable and avoids accidental
/// writes into system directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Checks that a client-supplied filename stays inside the flat media
/// directory: exactly one normal path component, no traversal, not hidden.
pub fn is_safe_media_filename(value: &str) -> bool {
    if value.is_empty() || value.starts_with('.') {
        return false;
    }
    let mut components = Path::new(value).components();
    let safe = matches!(components.next(), Some(Component::Normal(_)));
    safe && components.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn safe_media_filename_accepts_plain_names() {
        assert!(is_safe_media_filename("My_Song.mp3"));
        assert!(is_safe_media_filename("clip (1).mp4"));
    }

    #[test]
    fn safe_media_filename_rejects_traversal() {
        assert!(!is_safe_media_filename(""));
        assert!(!is_safe_media_filename(".."));
        assert!(!is_safe_media_filename("../etc/passwd"));
        assert!(!is_safe_media_filename("nested/child.mp3"));
        assert!(!is_safe_media_filename("/abs/path.mp3"));
        assert!(!is_safe_media_filename(".hidden"));
    }
}
