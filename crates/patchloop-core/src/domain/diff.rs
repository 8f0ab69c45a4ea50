//! Unified diff parsing, statistics and application
//!
//! Candidates carry multi-file unified diffs. `UnifiedPatch` parses them into
//! per-file hunks, `DiffStats` summarises what they touch, and `apply_to`
//! writes them into a directory tree with strict context matching.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("malformed diff: {0}")]
    Malformed(String),

    #[error("unsafe path in diff: {0}")]
    UnsafePath(String),

    #[error("{0}: resolves outside the patch root")]
    Escapes(String),

    #[error("{path}: hunk at line {line} does not match file contents")]
    ContextMismatch { path: String, line: usize },

    #[error("{0}: file does not exist")]
    MissingFile(String),

    #[error("{0}: file already exists")]
    AlreadyExists(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PatchResult<T> = std::result::Result<T, PatchError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    fn new_lines(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.clone()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }
}

/// Changes to one file. `None` on either side means `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    /// Path the patch is about: the new path, or the old one for deletions.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path.is_none()
    }

    pub fn is_creation(&self) -> bool {
        self.old_path.is_none()
    }
}

/// A parsed multi-file unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedPatch {
    pub files: Vec<FilePatch>,
}

impl UnifiedPatch {
    pub fn parse(diff: &str) -> PatchResult<Self> {
        let lines: Vec<&str> = diff.lines().collect();
        let mut files = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let Some(old) = lines[i].strip_prefix("--- ") else {
                // diff --git, index, mode lines and prose are skipped
                i += 1;
                continue;
            };
            let Some(new) = lines.get(i + 1).and_then(|l| l.strip_prefix("+++ ")) else {
                i += 1;
                continue;
            };
            let old_path = header_path(old, "a/");
            let new_path = header_path(new, "b/");
            if old_path.is_none() && new_path.is_none() {
                return Err(PatchError::Malformed(format!(
                    "both sides are /dev/null at line {}",
                    i + 1
                )));
            }
            i += 2;

            let mut hunks = Vec::new();
            while i < lines.len() && lines[i].starts_with("@@") {
                hunks.push(parse_hunk(&lines, &mut i)?);
            }
            if hunks.is_empty() {
                return Err(PatchError::Malformed(format!(
                    "no hunks for {}",
                    new_path.as_deref().or(old_path.as_deref()).unwrap_or_default()
                )));
            }
            files.push(FilePatch {
                old_path,
                new_path,
                hunks,
            });
        }

        if files.is_empty() {
            return Err(PatchError::Malformed("no file headers found".into()));
        }
        Ok(Self { files })
    }

    pub fn stats(&self) -> DiffStats {
        let mut stats = DiffStats::default();
        for file in &self.files {
            stats.files.insert(file.path().to_string());
            if file.is_deletion() {
                stats.deleted_files.insert(file.path().to_string());
            }
            for hunk in &file.hunks {
                for line in &hunk.lines {
                    match line {
                        HunkLine::Add(s) => {
                            stats.added_lines += 1;
                            stats.added_text.push(s.clone());
                        }
                        HunkLine::Remove(_) => stats.removed_lines += 1,
                        HunkLine::Context(_) => {}
                    }
                }
            }
        }
        stats
    }

    /// Apply every file patch under `root`. Nothing is written unless all
    /// hunks of all files apply and every path resolves inside `root`.
    pub fn apply_to(&self, root: &Path) -> PatchResult<()> {
        let base = root.canonicalize()?;
        for file in &self.files {
            for p in [&file.old_path, &file.new_path].into_iter().flatten() {
                confine(p)?;
                contain(&base, &root.join(p), p)?;
            }
        }

        // path -> staged contents (None = delete)
        let mut staged: BTreeMap<PathBuf, Option<Staged>> = BTreeMap::new();
        for file in &self.files {
            let rel = file.path();
            let target = root.join(rel);

            let current = match staged.get(&target) {
                Some(entry) => entry.clone(),
                None if target.is_file() => Some(Staged::read(&target)?),
                None => None,
            };

            let next = if file.is_creation() {
                if current.is_some() {
                    return Err(PatchError::AlreadyExists(rel.to_string()));
                }
                let mut created = Staged::empty();
                apply_hunks(rel, &mut created.lines, &file.hunks)?;
                Some(created)
            } else {
                let Some(mut existing) = current else {
                    return Err(PatchError::MissingFile(rel.to_string()));
                };
                apply_hunks(rel, &mut existing.lines, &file.hunks)?;
                if file.is_deletion() {
                    None
                } else {
                    Some(existing)
                }
            };
            staged.insert(target, next);
        }

        for (path, contents) in staged {
            match contents {
                Some(staged) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&path, staged.render())?;
                }
                None => {
                    if path.exists() {
                        fs::remove_file(&path)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Staged {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl Staged {
    fn empty() -> Self {
        Self {
            lines: Vec::new(),
            trailing_newline: true,
        }
    }

    fn read(path: &Path) -> PatchResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self {
            trailing_newline: text.is_empty() || text.ends_with('\n'),
            lines: text.lines().map(str::to_string).collect(),
        })
    }

    fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// Summary of what a diff touches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files: BTreeSet<String>,
    pub added_lines: u32,
    pub removed_lines: u32,
    pub deleted_files: BTreeSet<String>,
    #[serde(skip)]
    pub added_text: Vec<String>,
}

impl DiffStats {
    /// Stats for a diff, or empty stats if it does not parse.
    pub fn from_diff(diff: &str) -> Self {
        UnifiedPatch::parse(diff)
            .map(|p| p.stats())
            .unwrap_or_default()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn changed_lines(&self) -> u32 {
        self.added_lines + self.removed_lines
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// True when `path` is relative and stays inside its root.
pub fn is_confined(path: &str) -> bool {
    confine(path).is_ok()
}

fn confine(path: &str) -> PatchResult<()> {
    if path.is_empty() || path.starts_with('~') || path.contains('\\') {
        return Err(PatchError::UnsafePath(path.to_string()));
    }
    let escapes = Path::new(path).components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(PatchError::UnsafePath(path.to_string()));
    }
    Ok(())
}

/// Refuse `target` when its deepest existing ancestor resolves outside
/// `base`. Dangling links count as escapes.
fn contain(base: &Path, target: &Path, rel: &str) -> PatchResult<()> {
    let escapes = || PatchError::Escapes(rel.to_string());
    let mut current = Some(target);
    while let Some(path) = current {
        if fs::symlink_metadata(path).is_ok() {
            let resolved = path.canonicalize().map_err(|_| escapes())?;
            return if resolved.starts_with(base) {
                Ok(())
            } else {
                Err(escapes())
            };
        }
        current = path.parent();
    }
    Err(escapes())
}

fn header_path(raw: &str, prefix: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or_default().trim();
    if raw == "/dev/null" {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}

fn parse_range(s: &str) -> PatchResult<(usize, usize)> {
    let bad = || PatchError::Malformed(format!("invalid hunk range: {s}"));
    match s.split_once(',') {
        Some((start, count)) => Ok((
            start.parse().map_err(|_| bad())?,
            count.parse().map_err(|_| bad())?,
        )),
        None => Ok((s.parse().map_err(|_| bad())?, 1)),
    }
}

fn parse_hunk(lines: &[&str], idx: &mut usize) -> PatchResult<Hunk> {
    let header = lines[*idx];
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "@@" {
        return Err(PatchError::Malformed(format!("invalid hunk header: {header}")));
    }
    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;
    *idx += 1;

    let mut body = Vec::new();
    let (mut old_seen, mut new_seen) = (0, 0);
    while (old_seen < old_count || new_seen < new_count) && *idx < lines.len() {
        let line = lines[*idx];
        *idx += 1;
        match line.as_bytes().first() {
            Some(b' ') | None => {
                body.push(HunkLine::Context(line.get(1..).unwrap_or_default().to_string()));
                old_seen += 1;
                new_seen += 1;
            }
            Some(b'-') => {
                body.push(HunkLine::Remove(line[1..].to_string()));
                old_seen += 1;
            }
            Some(b'+') => {
                body.push(HunkLine::Add(line[1..].to_string()));
                new_seen += 1;
            }
            Some(b'\\') => {}
            _ => {
                return Err(PatchError::Malformed(format!(
                    "unexpected line in hunk: {line}"
                )))
            }
        }
    }
    if old_seen != old_count || new_seen != new_count {
        return Err(PatchError::Malformed(format!("truncated hunk: {header}")));
    }
    // "\ No newline at end of file" after the last line
    if lines.get(*idx).is_some_and(|l| l.starts_with('\\')) {
        *idx += 1;
    }

    Ok(Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: body,
    })
}

fn apply_hunks(path: &str, lines: &mut Vec<String>, hunks: &[Hunk]) -> PatchResult<()> {
    let mut offset: isize = 0;
    // hunks never match before the end of the previous one
    let mut floor = 0;
    for hunk in hunks {
        let expected = hunk.old_lines();
        // zero-length hunks insert after old_start
        let base = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let wanted = (base as isize + offset).max(0) as usize;
        let at = locate(lines, &expected, wanted, floor).ok_or_else(|| PatchError::ContextMismatch {
            path: path.to_string(),
            line: hunk.old_start,
        })?;
        let replacement = hunk.new_lines();
        offset += replacement.len() as isize - expected.len() as isize;
        offset += at as isize - wanted as isize;
        floor = at + replacement.len();
        lines.splice(at..at + expected.len(), replacement);
    }
    Ok(())
}

/// Position at or after `floor`, closest to `wanted`, where `expected`
/// occurs verbatim.
fn locate(lines: &[String], expected: &[&str], wanted: usize, floor: usize) -> Option<usize> {
    if expected.len() > lines.len() {
        return None;
    }
    let last = lines.len() - expected.len();
    if floor > last {
        return None;
    }
    let matches_at = |at: usize| {
        lines[at..at + expected.len()]
            .iter()
            .zip(expected)
            .all(|(a, b)| a == b)
    };
    let wanted = wanted.clamp(floor, last);
    (0..=last - floor).find_map(|distance| {
        [wanted.checked_sub(distance), wanted.checked_add(distance)]
            .into_iter()
            .flatten()
            .filter(|at| (floor..=last).contains(at))
            .find(|at| matches_at(*at))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIX: &str = "diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,3 @@
 pub fn answer() -> u32 {
-    41
+    42
 }
";

    #[test]
    fn parses_and_summarises() {
        let patch = UnifiedPatch::parse(FIX).unwrap();
        assert_eq!(patch.files.len(), 1);
        let stats = patch.stats();
        assert_eq!(stats.files.iter().next().unwrap(), "src/lib.rs");
        assert_eq!(stats.added_lines, 1);
        assert_eq!(stats.removed_lines, 1);
        assert_eq!(stats.changed_lines(), 2);
        assert!(stats.deleted_files.is_empty());
    }

    #[test]
    fn applies_with_strict_context() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/lib.rs"),
            "pub fn answer() -> u32 {\n    41\n}\n",
        )
        .unwrap();

        UnifiedPatch::parse(FIX).unwrap().apply_to(dir.path()).unwrap();
        let out = fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert_eq!(out, "pub fn answer() -> u32 {\n    42\n}\n");

        // applying again fails: the removed line is gone
        let err = UnifiedPatch::parse(FIX).unwrap().apply_to(dir.path()).unwrap_err();
        assert!(matches!(err, PatchError::ContextMismatch { .. }));
    }

    #[test]
    fn hunk_found_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/lib.rs"),
            "// header\n// more\npub fn answer() -> u32 {\n    41\n}\n",
        )
        .unwrap();
        UnifiedPatch::parse(FIX).unwrap().apply_to(dir.path()).unwrap();
        let out = fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert!(out.contains("    42"));
    }

    #[test]
    fn creates_and_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.txt"), "bye\n").unwrap();
        let diff = "--- /dev/null
+++ b/docs/new.txt
@@ -0,0 +1,2 @@
+hello
+world
--- a/old.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
";
        let patch = UnifiedPatch::parse(diff).unwrap();
        let stats = patch.stats();
        assert!(stats.deleted_files.contains("old.txt"));
        assert_eq!(stats.file_count(), 2);

        patch.apply_to(dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("docs/new.txt")).unwrap(),
            "hello\nworld\n"
        );
        assert!(!dir.path().join("old.txt").exists());
    }

    #[test]
    fn refuses_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let diff = "--- /dev/null
+++ b/../escape.txt
@@ -0,0 +1 @@
+x
";
        let err = UnifiedPatch::parse(diff).unwrap().apply_to(dir.path()).unwrap_err();
        assert!(matches!(err, PatchError::UnsafePath(_)));
        assert!(!is_confined("/etc/passwd"));
        assert!(is_confined("src/lib.rs"));
    }

    #[test]
    fn later_hunk_never_matches_before_earlier_one() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("list.txt"), "x\none\nx\ntwo\nx\n").unwrap();
        let diff = "--- a/list.txt
+++ b/list.txt
@@ -2,2 +2,2 @@
 one
-x
+y
@@ -1 +1 @@
-x
+z
";
        UnifiedPatch::parse(diff).unwrap().apply_to(dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("list.txt")).unwrap(),
            "x\none\ny\ntwo\nz\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn refuses_writes_through_links_leaving_root() {
        use std::os::unix::fs::symlink;

        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        symlink(outside.path(), root.path().join("out")).unwrap();

        let diff = "--- /dev/null\n+++ b/out/evil.txt\n@@ -0,0 +1 @@\n+pwned\n";
        let err = UnifiedPatch::parse(diff).unwrap().apply_to(root.path()).unwrap_err();
        assert!(matches!(err, PatchError::Escapes(_)), "{err}");
        assert!(!outside.path().join("evil.txt").exists());

        // a dangling link is refused too
        symlink(root.path().join("missing"), root.path().join("dangling")).unwrap();
        let diff = "--- /dev/null\n+++ b/dangling\n@@ -0,0 +1 @@\n+x\n";
        let err = UnifiedPatch::parse(diff).unwrap().apply_to(root.path()).unwrap_err();
        assert!(matches!(err, PatchError::Escapes(_)), "{err}");

        // links that stay inside the root are followed
        fs::create_dir(root.path().join("real")).unwrap();
        symlink(root.path().join("real"), root.path().join("inner")).unwrap();
        let diff = "--- /dev/null\n+++ b/inner/ok.txt\n@@ -0,0 +1 @@\n+fine\n";
        UnifiedPatch::parse(diff).unwrap().apply_to(root.path()).unwrap();
        assert!(root.path().join("real/ok.txt").exists());
    }

    #[test]
    fn rejects_prose() {
        assert!(UnifiedPatch::parse("I could not find a fix.").is_err());
        assert!(DiffStats::from_diff("nothing here").is_empty());
    }
}
