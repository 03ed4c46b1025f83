//! Narrow trait seams standing in for out-of-scope concerns (spec.md §1,
//! §4.4.3): filename sanitization and file-type sniffing. The receiver
//! needs *some* implementation to land files on disk, so a default ships,
//! but neither trait is load-bearing for the protocol itself.

use std::path::Path;

/// Cleans a filename received over the wire before it touches the
/// filesystem.
pub trait FilenameSanitizer: Send + Sync {
    fn sanitize(&self, raw: &str) -> String;
}

/// Best-effort file-type identification for a file that just landed in
/// the downloads directory.
pub trait FileTypeSniffer: Send + Sync {
    fn sniff(&self, path: &Path) -> Option<String>;
}

/// Strips path separators, rejects `..` traversal, clamps length, and
/// preserves the extension (spec.md §4.4.3).
pub struct DefaultFilenameSanitizer {
    pub max_len: usize,
}

impl Default for DefaultFilenameSanitizer {
    fn default() -> Self {
        Self { max_len: 200 }
    }
}

impl FilenameSanitizer for DefaultFilenameSanitizer {
    fn sanitize(&self, raw: &str) -> String {
        let no_sep: String = raw
            .chars()
            .filter(|&c| c != '/' && c != '\\' && c != '\0')
            .collect();

        let cleaned = no_sep.replace("..", "_");

        let cleaned = if cleaned.trim().is_empty() {
            "unnamed".to_string()
        } else {
            cleaned
        };

        if cleaned.len() <= self.max_len {
            return cleaned;
        }

        // Preserve the extension while truncating the stem.
        match cleaned.rfind('.') {
            Some(dot) if cleaned.len() - dot <= self.max_len => {
                let ext = &cleaned[dot..];
                let keep = self.max_len - ext.len();
                format!("{}{}", &cleaned[..keep], ext)
            }
            _ => cleaned.chars().take(self.max_len).collect(),
        }
    }
}

/// Wraps the `mime_guess` crate.
#[derive(Default)]
pub struct MimeGuessSniffer;

impl FileTypeSniffer for MimeGuessSniffer {
    fn sniff(&self, path: &Path) -> Option<String> {
        mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_path_separators() {
        let s = DefaultFilenameSanitizer::default();
        let cleaned = s.sanitize("../../etc/passwd");
        assert!(!cleaned.contains('/'));
        assert!(!cleaned.contains('\\'));
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        let s = DefaultFilenameSanitizer::default();
        let cleaned = s.sanitize("..\\..\\secret..txt");
        assert!(!cleaned.contains(".."));
        assert!(!cleaned.contains('/'));
        assert!(!cleaned.contains('\\'));
    }

    #[test]
    fn clamps_length_preserving_extension() {
        let s = DefaultFilenameSanitizer { max_len: 10 };
        let cleaned = s.sanitize(&format!("{}.bin", "x".repeat(50)));
        assert!(cleaned.len() <= 10);
        assert!(cleaned.ends_with(".bin"));
    }

    #[test]
    fn empty_name_becomes_placeholder() {
        let s = DefaultFilenameSanitizer::default();
        assert_eq!(s.sanitize(""), "unnamed");
    }
}
