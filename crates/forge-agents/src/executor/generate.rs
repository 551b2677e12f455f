//! Parsing of oracle code-generation output.
//!
//! The generation contract: each file is announced by a `FILE: <path>`
//! marker line followed by a fenced code block holding its content.
//! Anything outside that structure (prose, explanations) is ignored.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

static FILE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:FILE|File|file):\s*`?(?P<path>[^\s`]+)`?\s*$").unwrap()
});

/// Extract `(path, content)` pairs from a generation reply.
pub fn parse_generated_files(reply: &str) -> Vec<(String, String)> {
    let mut files = Vec::new();

    for caps in FILE_MARKER.captures_iter(reply) {
        let path = caps["path"].to_string();
        let after_marker = &reply[caps.get(0).map(|m| m.end()).unwrap_or(0)..];
        if let Some(content) = next_fenced_block(after_marker) {
            debug!(path = %path, bytes = content.len(), "parsed generated file");
            files.push((path, content));
        }
    }

    files
}

/// The content of the first fenced code block in `text`, if the fence is
/// properly closed.
fn next_fenced_block(text: &str) -> Option<String> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    // Skip the info string (language tag) up to the end of its line.
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    let mut content = body[..close].to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    Some(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_file() {
        let reply = "Here is the component:\n\nFILE: src/App.tsx\n```tsx\nexport const App = () => null;\n```\n";
        let files = parse_generated_files(reply);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "src/App.tsx");
        assert_eq!(files[0].1, "export const App = () => null;\n");
    }

    #[test]
    fn test_multiple_files_in_order() {
        let reply = "FILE: a.ts\n```ts\nconst a = 1;\n```\n\nSome prose.\n\nFILE: b.ts\n```ts\nconst b = 2;\n```";
        let files = parse_generated_files(reply);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0, "a.ts");
        assert_eq!(files[1].0, "b.ts");
        assert_eq!(files[1].1, "const b = 2;\n");
    }

    #[test]
    fn test_marker_with_backticks_and_lowercase() {
        let reply = "file: `src/util.ts`\n```ts\nexport {}\n```";
        let files = parse_generated_files(reply);
        assert_eq!(files[0].0, "src/util.ts");
    }

    #[test]
    fn test_unclosed_fence_skipped() {
        let reply = "FILE: broken.ts\n```ts\nno closing fence";
        assert!(parse_generated_files(reply).is_empty());
    }

    #[test]
    fn test_marker_without_block_skipped() {
        let reply = "FILE: orphan.ts\n\nNo code block followed.";
        assert!(parse_generated_files(reply).is_empty());
    }

    #[test]
    fn test_prose_only_yields_nothing() {
        assert!(parse_generated_files("I could not generate the files.").is_empty());
    }

    #[test]
    fn test_block_content_preserves_interior_backticks() {
        let reply = "FILE: doc.md\n```md\nUse `foo()` here.\n```";
        let files = parse_generated_files(reply);
        assert_eq!(files[0].1, "Use `foo()` here.\n");
    }
}
