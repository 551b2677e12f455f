//! Sandboxed workspace file operations and search/replace fix application.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::diagnosis::Fix;
use crate::error::AgentError;
use crate::executor::plan::ModifyMode;

/// The build's working directory. All paths are validated to stay inside.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path, rejecting escapes from the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, AgentError> {
        let candidate = Path::new(relative);
        if candidate.is_absolute()
            || candidate
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(anyhow::anyhow!("path `{relative}` escapes the workspace").into());
        }
        Ok(self.root.join(candidate))
    }

    pub async fn read(&self, relative: &str) -> Result<String, AgentError> {
        let path = self.resolve(relative)?;
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    pub async fn write(&self, relative: &str, content: &str) -> Result<usize, AgentError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        debug!(path = %path.display(), bytes = content.len(), "wrote file");
        Ok(content.len())
    }

    pub async fn delete(&self, relative: &str) -> Result<(), AgentError> {
        let path = self.resolve(relative)?;
        tokio::fs::remove_file(&path).await?;
        debug!(path = %path.display(), "deleted file");
        Ok(())
    }

    /// Apply a modify-mode edit, returning the new file size.
    pub async fn modify(&self, relative: &str, mode: &ModifyMode) -> Result<usize, AgentError> {
        let new_content = match mode {
            ModifyMode::Replace { content } => content.clone(),
            ModifyMode::Append { content } => {
                let mut existing = self.read(relative).await?;
                existing.push_str(content);
                existing
            }
            ModifyMode::Insert { position, content } => {
                let existing = self.read(relative).await?;
                let mut at = (*position).min(existing.len());
                // Clamp into a char boundary so the splice is valid UTF-8.
                while at > 0 && !existing.is_char_boundary(at) {
                    at -= 1;
                }
                let mut result = String::with_capacity(existing.len() + content.len());
                result.push_str(&existing[..at]);
                result.push_str(content);
                result.push_str(&existing[at..]);
                result
            }
            ModifyMode::SearchReplace { search, replace } => {
                let existing = self.read(relative).await?;
                apply_search_replace(&existing, search, replace).ok_or_else(|| {
                    AgentError::from(anyhow::anyhow!(
                        "search text not found exactly once in {relative}"
                    ))
                })?
            }
        };
        self.write(relative, &new_content).await
    }

    /// Apply one diagnosis fix. Returns whether the edit landed.
    ///
    /// Exact matching is tried first. When the search text is missing
    /// entirely, a whitespace-normalized match is attempted — oracle fixes
    /// frequently carry drifted indentation — and the replacement is
    /// re-indented to the region it lands in. Advisory fixes (empty search
    /// text) and ambiguous matches report `false` rather than failing the
    /// build; the healing loop stops when nothing applies.
    pub async fn apply_fix(&self, fix: &Fix) -> Result<bool, AgentError> {
        if !fix.is_applicable() {
            debug!(file = %fix.file, "advisory fix skipped (no search text)");
            return Ok(false);
        }

        let existing = match self.read(&fix.file).await {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %fix.file, error = %e, "fix target unreadable");
                return Ok(false);
            }
        };

        if let Some(updated) = apply_search_replace(&existing, &fix.search_text, &fix.replace_text)
        {
            self.write(&fix.file, &updated).await?;
            debug!(file = %fix.file, line = ?fix.line, "fix applied");
            return Ok(true);
        }

        if count_occurrences(&existing, &fix.search_text) == 0 {
            if let Some((start, end)) = fuzzy_find_unique(&existing, &fix.search_text) {
                let region = &existing[start..end];
                let mut replacement = rebase_indent(region, &fix.replace_text);
                if region.ends_with('\n') && !replacement.ends_with('\n') {
                    replacement.push('\n');
                }
                let mut updated =
                    String::with_capacity(existing.len() - (end - start) + replacement.len());
                updated.push_str(&existing[..start]);
                updated.push_str(&replacement);
                updated.push_str(&existing[end..]);
                if updated != existing {
                    self.write(&fix.file, &updated).await?;
                    debug!(
                        file = %fix.file,
                        line = ?fix.line,
                        "fix applied via whitespace-normalized match"
                    );
                    return Ok(true);
                }
            }
        }

        warn!(
            file = %fix.file,
            occurrences = count_occurrences(&existing, &fix.search_text),
            "fix search text did not match exactly once"
        );
        Ok(false)
    }
}

/// One line with interior whitespace runs squeezed to single spaces.
/// Used for indentation-insensitive line comparison.
fn canon_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for word in line.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// The leading-whitespace string of the first non-blank line.
fn base_prefix(text: &str) -> &str {
    for line in text.lines() {
        let trimmed = line.trim_start();
        if !trimmed.is_empty() {
            return &line[..line.len() - trimmed.len()];
        }
    }
    ""
}

/// Rebase `replacement` onto the matched region's indentation.
///
/// Works by prefix transplant rather than width arithmetic: the
/// replacement's own base prefix is stripped from each line and the
/// region's base prefix takes its place, so nested lines keep their
/// relative depth and tabs survive untouched.
fn rebase_indent(region: &str, replacement: &str) -> String {
    let target = base_prefix(region);
    let source = base_prefix(replacement);
    if target == source {
        return replacement.to_string();
    }

    let rebased: Vec<String> = replacement
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else if let Some(rest) = line.strip_prefix(source) {
                format!("{target}{rest}")
            } else {
                // A line shallower than the replacement's own base (mixed
                // tabs and spaces): anchor it at the target prefix.
                format!("{target}{}", line.trim_start())
            }
        })
        .collect();

    let mut result = rebased.join("\n");
    if replacement.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Find a unique whitespace-normalized match of `needle` in `content`,
/// returning its byte range. `None` unless exactly one window matches.
fn fuzzy_find_unique(content: &str, needle: &str) -> Option<(usize, usize)> {
    let needle_lines: Vec<String> = needle.lines().map(canon_line).collect();
    if needle_lines.is_empty() || needle_lines.iter().all(|l| l.is_empty()) {
        return None;
    }

    let content_lines: Vec<&str> = content.lines().collect();
    let normalized: Vec<String> = content_lines.iter().map(|l| canon_line(l)).collect();

    let window = needle_lines.len();
    if window > content_lines.len() {
        return None;
    }
    let mut matches = Vec::new();
    for start in 0..=(content_lines.len() - window) {
        if normalized[start..start + window] == needle_lines[..] {
            matches.push(start);
        }
    }
    if matches.len() != 1 {
        return None;
    }

    let start_line = matches[0];
    let end_line = start_line + window;

    // Convert line indices to byte offsets against the raw content.
    let mut offsets = Vec::with_capacity(content_lines.len() + 1);
    let mut pos = 0;
    offsets.push(0);
    for chunk in content.split_inclusive('\n') {
        pos += chunk.len();
        offsets.push(pos);
    }
    let start_byte = *offsets.get(start_line)?;
    let end_byte = if end_line >= offsets.len() - 1 {
        content.len()
    } else {
        *offsets.get(end_line)?
    };
    Some((start_byte, end_byte))
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        count += 1;
        start += pos + 1;
    }
    count
}

/// Replace `search` with `replace` when it matches exactly once and the
/// replacement actually changes the content.
fn apply_search_replace(content: &str, search: &str, replace: &str) -> Option<String> {
    if search.is_empty() || count_occurrences(content, search) != 1 {
        return None;
    }
    let updated = content.replacen(search, replace, 1);
    // No-op edits are rejected so the healer never counts them as applied.
    (updated != content).then_some(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn workspace() -> (Workspace, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Workspace::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let (ws, _dir) = workspace().await;
        ws.write("src/app.ts", "export {}").await.unwrap();
        assert_eq!(ws.read("src/app.ts").await.unwrap(), "export {}");
        ws.delete("src/app.ts").await.unwrap();
        assert!(ws.read("src/app.ts").await.is_err());
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let (ws, _dir) = workspace().await;
        assert!(ws.resolve("../outside.txt").is_err());
        assert!(ws.resolve("/etc/passwd").is_err());
        assert!(ws.resolve("nested/../../outside").is_err());
        assert!(ws.resolve("nested/ok.txt").is_ok());
    }

    #[tokio::test]
    async fn test_modify_append_and_insert() {
        let (ws, _dir) = workspace().await;
        ws.write("a.txt", "hello").await.unwrap();

        ws.modify(
            "a.txt",
            &ModifyMode::Append {
                content: " world".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(ws.read("a.txt").await.unwrap(), "hello world");

        ws.modify(
            "a.txt",
            &ModifyMode::Insert {
                position: 5,
                content: ",".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(ws.read("a.txt").await.unwrap(), "hello, world");

        // Position past the end clamps to append.
        ws.modify(
            "a.txt",
            &ModifyMode::Insert {
                position: 9999,
                content: "!".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(ws.read("a.txt").await.unwrap(), "hello, world!");
    }

    #[tokio::test]
    async fn test_modify_search_replace() {
        let (ws, _dir) = workspace().await;
        ws.write("a.js", "const x = 1;\nconst y = 2;\n").await.unwrap();
        ws.modify(
            "a.js",
            &ModifyMode::SearchReplace {
                search: "const y = 2;".into(),
                replace: "const y = 3;".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(ws.read("a.js").await.unwrap(), "const x = 1;\nconst y = 3;\n");
    }

    #[tokio::test]
    async fn test_modify_search_replace_ambiguous_fails() {
        let (ws, _dir) = workspace().await;
        ws.write("a.js", "x\nx\n").await.unwrap();
        let err = ws
            .modify(
                "a.js",
                &ModifyMode::SearchReplace {
                    search: "x".into(),
                    replace: "y".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exactly once"));
    }

    #[tokio::test]
    async fn test_apply_fix_exact_match() {
        let (ws, _dir) = workspace().await;
        ws.write("src/x.go", "func main() {\n\tFoo()\n}\n").await.unwrap();

        let fix = Fix {
            file: "src/x.go".into(),
            line: Some(2),
            description: "call Bar instead".into(),
            search_text: "\tFoo()\n".into(),
            replace_text: "\tBar()\n".into(),
        };
        assert!(ws.apply_fix(&fix).await.unwrap());
        assert_eq!(ws.read("src/x.go").await.unwrap(), "func main() {\n\tBar()\n}\n");
    }

    #[tokio::test]
    async fn test_apply_fix_advisory_not_applied() {
        let (ws, _dir) = workspace().await;
        ws.write("src/x.go", "package main\n").await.unwrap();

        let fix = Fix {
            file: "src/x.go".into(),
            line: Some(10),
            description: "define Foo".into(),
            search_text: String::new(),
            replace_text: String::new(),
        };
        assert!(!ws.apply_fix(&fix).await.unwrap());
        assert_eq!(ws.read("src/x.go").await.unwrap(), "package main\n");
    }

    #[tokio::test]
    async fn test_apply_fix_no_match_not_applied() {
        let (ws, _dir) = workspace().await;
        ws.write("a.ts", "let x = 1;").await.unwrap();

        let fix = Fix {
            file: "a.ts".into(),
            line: None,
            description: "rename".into(),
            search_text: "let z = 9;".into(),
            replace_text: "let z = 10;".into(),
        };
        assert!(!ws.apply_fix(&fix).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_fix_missing_file_not_applied() {
        let (ws, _dir) = workspace().await;
        let fix = Fix {
            file: "ghost.ts".into(),
            line: None,
            description: "x".into(),
            search_text: "a".into(),
            replace_text: "b".into(),
        };
        assert!(!ws.apply_fix(&fix).await.unwrap());
    }

    #[test]
    fn test_noop_replacement_rejected() {
        assert!(apply_search_replace("abc", "b", "b").is_none());
        assert_eq!(apply_search_replace("abc", "b", "x"), Some("axc".into()));
    }

    #[tokio::test]
    async fn test_apply_fix_fuzzy_whitespace_match() {
        let (ws, _dir) = workspace().await;
        ws.write(
            "src/app.js",
            "class A {\n    run() {\n        work();\n    }\n}\n",
        )
        .await
        .unwrap();

        // The oracle's search text lost all indentation, so the exact
        // match fails and the whitespace-normalized path applies.
        let fix = Fix {
            file: "src/app.js".into(),
            line: Some(2),
            description: "retry the work".into(),
            search_text: "run() {\nwork();\n}".into(),
            replace_text: "run() {\nretry(work);\n}".into(),
        };
        assert!(ws.apply_fix(&fix).await.unwrap());
        // The replacement was shifted to the region's base indentation.
        assert_eq!(
            ws.read("src/app.js").await.unwrap(),
            "class A {\n    run() {\n    retry(work);\n    }\n}\n"
        );
    }

    #[tokio::test]
    async fn test_apply_fix_fuzzy_ambiguous_not_applied() {
        let (ws, _dir) = workspace().await;
        ws.write("a.js", "  a();\n  b();\n  a();\n  b();\n").await.unwrap();

        let fix = Fix {
            file: "a.js".into(),
            line: None,
            description: "x".into(),
            search_text: "a();\nb();".into(),
            replace_text: "c();".into(),
        };
        // Two normalized matches: refuse to guess.
        assert!(!ws.apply_fix(&fix).await.unwrap());
        assert_eq!(ws.read("a.js").await.unwrap(), "  a();\n  b();\n  a();\n  b();\n");
    }

    #[test]
    fn test_canon_line_squeezes_whitespace() {
        assert_eq!(canon_line("  a   b  "), "a b");
        assert_eq!(canon_line("\tfn x()\t{"), "fn x() {");
        assert_eq!(canon_line("   "), "");
    }

    #[test]
    fn test_base_prefix_first_non_blank_line() {
        assert_eq!(base_prefix("    foo();\n        bar();"), "    ");
        assert_eq!(base_prefix("\n\n\tfoo();"), "\t");
        assert_eq!(base_prefix("foo();"), "");
        assert_eq!(base_prefix("  \n   \n"), "");
    }

    #[test]
    fn test_rebase_indent_transplants_prefix() {
        let region = "    foo();\n    bar();";
        let result = rebase_indent(region, "foo();\nbaz();");
        assert_eq!(result, "    foo();\n    baz();");

        let flat = rebase_indent("foo();", "    foo2();");
        assert_eq!(flat, "foo2();");
    }

    #[test]
    fn test_rebase_indent_keeps_relative_depth() {
        let region = "\tif (x) {\n\t\tgo();\n\t}";
        let result = rebase_indent(region, "if (x) {\n    go();\n}");
        // Base becomes the region's tab; nested lines keep their own extra
        // depth beyond the stripped base.
        assert_eq!(result, "\tif (x) {\n\t    go();\n\t}");
    }

    #[test]
    fn test_fuzzy_find_unique_multiline() {
        let content = "a\n    x();\n    y();\nb\n";
        let range = fuzzy_find_unique(content, "x();\ny();").unwrap();
        assert_eq!(&content[range.0..range.1], "    x();\n    y();\n");

        assert!(fuzzy_find_unique(content, "z();").is_none());
        assert!(fuzzy_find_unique(content, "").is_none());
    }
}
