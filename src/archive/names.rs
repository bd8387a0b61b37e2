//! Archive entry naming

use std::collections::HashSet;

/// Name used when a filename reduces to nothing usable
const FALLBACK_NAME: &str = "file";

/// Assigns unique entry names in archive order.
///
/// The first occurrence of a name is kept as is; the n-th repeat of
/// `name.ext` becomes `name (n).ext`, skipping names already taken.
#[derive(Debug, Default)]
pub struct EntryNames {
    taken: HashSet<String>,
}

impl EntryNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, filename: &str) -> String {
        let base = base_name(filename);
        if self.taken.insert(base.clone()) {
            return base;
        }

        let (stem, ext) = split_extension(&base);
        let mut n = 1usize;
        loop {
            let candidate = format!("{} ({}){}", stem, n, ext);
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Strip any directory components so entries cannot escape the archive root
fn base_name(filename: &str) -> String {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    match name {
        "" | "." | ".." => FALLBACK_NAME.to_string(),
        other => other.to_string(),
    }
}

/// Split `name.ext` into `("name", ".ext")`; dotfiles keep their leading dot in the stem
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names_kept() {
        let mut names = EntryNames::new();
        assert_eq!(names.assign("a.txt"), "a.txt");
        assert_eq!(names.assign("b.txt"), "b.txt");
    }

    #[test]
    fn test_duplicates_get_index() {
        let mut names = EntryNames::new();
        assert_eq!(names.assign("a.txt"), "a.txt");
        assert_eq!(names.assign("a.txt"), "a (1).txt");
        assert_eq!(names.assign("a.txt"), "a (2).txt");
        assert_eq!(names.assign("README"), "README");
        assert_eq!(names.assign("README"), "README (1)");
    }

    #[test]
    fn test_generated_name_collision_skipped() {
        let mut names = EntryNames::new();
        assert_eq!(names.assign("a (1).txt"), "a (1).txt");
        assert_eq!(names.assign("a.txt"), "a.txt");
        assert_eq!(names.assign("a.txt"), "a (2).txt");
    }

    #[test]
    fn test_path_components_stripped() {
        let mut names = EntryNames::new();
        assert_eq!(names.assign("../../etc/passwd"), "passwd");
        assert_eq!(names.assign("C:\\Users\\me\\doc.txt"), "doc.txt");
        assert_eq!(names.assign(".."), "file");
        assert_eq!(names.assign("dir/"), "file (1)");
    }

    #[test]
    fn test_dotfiles() {
        let mut names = EntryNames::new();
        assert_eq!(names.assign(".env"), ".env");
        assert_eq!(names.assign(".env"), ".env (1)");
    }
}
