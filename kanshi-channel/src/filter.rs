//! Suppression of editor backup and temp-file names.

use std::{ffi::OsStr, path::Path};

/// Whether `name` looks like an editor artifact (`~foo`, `foo~`).
///
/// Nested names from recursive watches also match on their final
/// component, so `dir/~lock` is noise.
pub fn is_noise(name: &OsStr) -> bool {
    tilde_marked(name) || Path::new(name).file_name().is_some_and(tilde_marked)
}

fn tilde_marked(name: &OsStr) -> bool {
    let bytes = name.as_encoded_bytes();
    bytes.first() == Some(&b'~') || bytes.last() == Some(&b'~')
}

pub fn should_suppress(name: &OsStr, enabled: bool) -> bool {
    enabled && is_noise(name)
}

/// A rename is noise when either side of it is.
pub fn should_suppress_rename(old_name: &OsStr, new_name: &OsStr, enabled: bool) -> bool {
    enabled && (is_noise(old_name) || is_noise(new_name))
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use super::{is_noise, should_suppress, should_suppress_rename};

    fn os(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn tilde_prefix_and_suffix_are_noise() {
        for name in [
            "~lock.docx",
            "notes.txt~",
            "~",
            "~$report.xlsx",
            "sub/file~",
            "sub/~lock",
            "~dir/file.txt",
        ] {
            assert!(is_noise(os(name)), "{name}");
        }

        for name in ["notes.txt", "a~b", "", "sub/a~b"] {
            assert!(!is_noise(os(name)), "{name}");
        }
    }

    #[test]
    fn disabled_filter_never_suppresses() {
        assert!(!should_suppress(os("~lock"), false));
        assert!(!should_suppress_rename(os("~a"), os("b~"), false));
        assert!(should_suppress(os("~lock"), true));
    }

    #[test]
    fn rename_checks_both_names() {
        assert!(should_suppress_rename(os("~tmp"), os("real.txt"), true));
        assert!(should_suppress_rename(os("real.txt"), os("real.txt~"), true));
        assert!(!should_suppress_rename(os("a.txt"), os("b.txt"), true));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_names_are_checked_bytewise() {
        use std::os::unix::ffi::OsStrExt;

        assert!(is_noise(OsStr::from_bytes(b"\xff\xfe~")));
        assert!(!is_noise(OsStr::from_bytes(b"\xff\xfe")));
    }
}
