// The virtual disk BDOS's file functions and the CCP's directory commands
// operate against. Files live purely as name-indexed byte blobs in host
// memory; there is no sector/track geometry to simulate because nothing in
// the personality above BDOS cares about it.

use std::collections::BTreeMap;

/// Text-mode CP/M files are framed with CR/LF per line and a trailing
/// Ctrl-Z (0x1A) end-of-file marker.
pub const EOF_MARKER: u8 = 0x1A;

/// Upper-cases, trims surrounding whitespace, and drops a trailing dot, so
/// "foo.txt", "FOO.TXT", " foo.txt " and "foo.txt." all key the same entry.
pub fn normalize_name(raw: &str) -> String {
    let trimmed = raw.trim().to_ascii_uppercase();
    trimmed.strip_suffix('.').unwrap_or(&trimmed).to_string()
}

pub fn split_name_ext(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((n, e)) => (n, e),
        None => (name, ""),
    }
}

/// CP/M wildcard matching: `?` matches any single character, `*` matches
/// the remainder of its component. Name and extension are matched
/// independently, exactly as `DIR B*.*` or `DIR *.COM` expect.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    let (name_part, name_ext) = split_name_ext(name);
    let (pat_part, pat_ext) = split_name_ext(pattern);
    component_matches(name_part, pat_part) && component_matches(name_ext, pat_ext)
}

fn component_matches(value: &str, pattern: &str) -> bool {
    let value_chars: Vec<char> = value.chars().collect();
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let mut vi = 0;
    for &pc in &pattern_chars {
        if pc == '*' {
            return true;
        }
        if vi >= value_chars.len() {
            return false;
        }
        if pc != '?' && pc != value_chars[vi] {
            return false;
        }
        vi += 1;
    }
    vi == value_chars.len()
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DiskError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("no directory space available")]
    DirectoryFull,
}

/// An in-memory directory of named byte blobs, keyed by normalized
/// "NAME.EXT". Stands in for an actual disk image: reads, writes, renames,
/// and wildcard-driven enumeration are all that BDOS and the CCP ever need.
#[derive(Default)]
pub struct VirtualDisk {
    files: BTreeMap<String, Vec<u8>>,
}

impl VirtualDisk {
    pub fn new() -> Self {
        VirtualDisk { files: BTreeMap::new() }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.files.contains_key(&normalize_name(name))
    }

    pub fn read(&self, name: &str) -> Option<&[u8]> {
        self.files.get(&normalize_name(name)).map(|v| v.as_slice())
    }

    pub fn write(&mut self, name: &str, data: Vec<u8>) {
        self.files.insert(normalize_name(name), data);
    }

    /// Appends CR/LF-framed text and a trailing EOF marker, as a PIP-style
    /// text copy into a freshly created file would.
    pub fn write_text(&mut self, name: &str, lines: &[&str]) {
        let mut data = Vec::new();
        for line in lines {
            data.extend_from_slice(line.as_bytes());
            data.push(b'\r');
            data.push(b'\n');
        }
        data.push(EOF_MARKER);
        self.write(name, data);
    }

    /// Strips a trailing EOF marker (and anything after it) and splits on
    /// CR/LF, mirroring how TYPE reads a text file back. Embedded blank
    /// lines are kept; only the empty segment produced by the final
    /// trailing CR/LF before EOF is dropped, so this is the exact inverse
    /// of `write_text`.
    pub fn read_text_lines(&self, name: &str) -> Option<Vec<String>> {
        let data = self.read(name)?;
        let end = data.iter().position(|&b| b == EOF_MARKER).unwrap_or(data.len());
        let text = String::from_utf8_lossy(&data[..end]);
        let mut lines: Vec<String> = text.split("\r\n").map(|s| s.to_string()).collect();
        if lines.last().map_or(false, |line| line.is_empty()) {
            lines.pop();
        }
        Some(lines)
    }

    pub fn delete(&mut self, name: &str) -> Result<(), DiskError> {
        let key = normalize_name(name);
        self.files.remove(&key).map(|_| ()).ok_or(DiskError::NotFound(key))
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), DiskError> {
        let from_key = normalize_name(from);
        let data = self.files.remove(&from_key).ok_or(DiskError::NotFound(from_key))?;
        self.files.insert(normalize_name(to), data);
        Ok(())
    }

    /// Names matching `pattern`, in directory order, as DIR would list them.
    pub fn list(&self, pattern: &str) -> Vec<String> {
        let pattern = normalize_name(pattern);
        self.files
            .keys()
            .filter(|name| matches_pattern(name, &pattern))
            .cloned()
            .collect()
    }

    pub fn len(&self, name: &str) -> Option<usize> {
        self.files.get(&normalize_name(name)).map(|v| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_cases_and_strips_trailing_dot() {
        assert_eq!(normalize_name("  foo.txt  "), "FOO.TXT");
        assert_eq!(normalize_name("foo."), "FOO");
        assert_eq!(normalize_name("FOO.TXT"), "FOO.TXT");
    }

    #[test]
    fn star_matches_remainder_of_component() {
        assert!(matches_pattern("FOO.COM", "*.COM"));
        assert!(matches_pattern("FOO.COM", "F*.*"));
        assert!(!matches_pattern("FOO.TXT", "*.COM"));
    }

    #[test]
    fn question_mark_matches_single_character_only() {
        assert!(matches_pattern("FOO.COM", "F??.COM"));
        assert!(!matches_pattern("FO.COM", "F??.COM"));
        assert!(!matches_pattern("FOOO.COM", "F??.COM"));
    }

    #[test]
    fn name_and_extension_match_independently() {
        assert!(matches_pattern("FOO.COM", "*.COM"));
        assert!(!matches_pattern("FOO.COM", "BAR.*"));
    }

    #[test]
    fn write_and_read_round_trip_case_insensitively() {
        let mut disk = VirtualDisk::new();
        disk.write("foo.txt", vec![1, 2, 3]);
        assert_eq!(disk.read("FOO.TXT"), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn text_round_trip_preserves_lines_and_strips_eof_marker() {
        let mut disk = VirtualDisk::new();
        disk.write_text("A.TXT", &["hello", "world"]);
        let lines = disk.read_text_lines("A.TXT").unwrap();
        assert_eq!(lines, vec!["hello".to_string(), "world".to_string()]);
    }

    #[test]
    fn text_round_trip_keeps_embedded_blank_lines() {
        let mut disk = VirtualDisk::new();
        disk.write_text("A.TXT", &["hello", "", "world"]);
        let lines = disk.read_text_lines("A.TXT").unwrap();
        assert_eq!(
            lines,
            vec!["hello".to_string(), "".to_string(), "world".to_string()]
        );
    }

    #[test]
    fn delete_of_missing_file_is_an_error() {
        let mut disk = VirtualDisk::new();
        assert!(matches!(disk.delete("GONE.TXT"), Err(DiskError::NotFound(_))));
    }

    #[test]
    fn rename_moves_data_under_new_key() {
        let mut disk = VirtualDisk::new();
        disk.write("OLD.TXT", vec![9]);
        disk.rename("OLD.TXT", "NEW.TXT").unwrap();
        assert!(!disk.exists("OLD.TXT"));
        assert_eq!(disk.read("NEW.TXT"), Some(&[9u8][..]));
    }

    #[test]
    fn list_respects_wildcard_and_directory_order() {
        let mut disk = VirtualDisk::new();
        disk.write("A.COM", vec![]);
        disk.write("B.TXT", vec![]);
        disk.write("C.COM", vec![]);
        assert_eq!(disk.list("*.COM"), vec!["A.COM".to_string(), "C.COM".to_string()]);
    }
}
