//! Tool result sanitization.
//!
//! Everything a tool returns is scrubbed before it reaches conversation
//! history or a caller-facing stream: neither the model nor the end user
//! should see VCS internals, dependency directories, environment files, or
//! the host's absolute filesystem layout.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

/// File lists longer than this are truncated with a `truncated` flag.
pub const MAX_LIST_ITEMS: usize = 50;

static SENSITIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"\.git/", r"\.env", r"vendor/", r"node_modules/"]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
});

/// Absolute home-directory prefixes (`/home/<user>/<project>/`).
static HOME_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/home/[^/]+/[^/]+/").expect("static regex"));

/// Legacy per-client paths, shown as sandbox-relative.
static LEGACY_CLIENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*/clients/[^/]+/").expect("static regex"));

fn is_sensitive(path: &str) -> bool {
    SENSITIVE_PATTERNS.iter().any(|p| p.is_match(path))
}

fn rewrite_path(path: &str) -> String {
    let rewritten = HOME_PREFIX.replace(path, "");
    LEGACY_CLIENTS.replace(&rewritten, "sandbox/").into_owned()
}

/// Sanitize a tool result value.
///
/// - `files` lists are filtered of sensitive entries and truncated beyond
///   [`MAX_LIST_ITEMS`] with a `truncated` flag.
/// - `path` / `file_path` / `filePath` fields are rewritten to
///   repository-relative form.
/// - a bare string array that contained sensitive entries is collapsed to
///   a summary object so raw internals never leak through list output.
///
/// Anything else passes through unchanged.
pub fn sanitize_tool_result(result: &Value) -> Value {
    match result {
        Value::Object(map) => {
            let mut out = map.clone();

            if let Some(Value::Array(files)) = map.get("files") {
                let mut kept: Vec<Value> = files
                    .iter()
                    .filter(|f| f.as_str().is_none_or(|s| !is_sensitive(s)))
                    .cloned()
                    .collect();
                if kept.len() > MAX_LIST_ITEMS {
                    kept.truncate(MAX_LIST_ITEMS);
                    out.insert("truncated".into(), json!(true));
                    out.insert(
                        "message".into(),
                        json!(format!("File list truncated to {MAX_LIST_ITEMS} items.")),
                    );
                }
                out.insert("files".into(), Value::Array(kept));
            }

            for field in ["path", "file_path", "filePath"] {
                if let Some(Value::String(path)) = map.get(field) {
                    out.insert(field.into(), json!(rewrite_path(path)));
                }
            }

            Value::Object(out)
        }

        Value::Array(items) => {
            // A raw listing (e.g. repository objects).  If filtering removed
            // anything, summarize rather than exposing the partial listing.
            let all_strings = items.iter().all(Value::is_string);
            if !all_strings {
                return result.clone();
            }
            let kept: Vec<Value> = items
                .iter()
                .filter(|v| v.as_str().is_none_or(|s| !is_sensitive(s)))
                .cloned()
                .collect();
            if kept.len() < items.len() {
                json!({
                    "message": "Operation completed.",
                    "items_processed": items.len(),
                })
            } else {
                Value::Array(kept)
            }
        }

        other => other.clone(),
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_sensitive_entries_from_file_lists() {
        let result = json!({
            "files": ["src/main.rs", ".git/HEAD", ".env", "vendor/lib.rs", "README.md"],
        });
        let clean = sanitize_tool_result(&result);
        let files = clean["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], "src/main.rs");
        assert_eq!(files[1], "README.md");
    }

    #[test]
    fn truncates_long_file_lists() {
        let files: Vec<Value> = (0..80).map(|i| json!(format!("file_{i}.txt"))).collect();
        let clean = sanitize_tool_result(&json!({ "files": files }));

        assert_eq!(clean["files"].as_array().unwrap().len(), MAX_LIST_ITEMS);
        assert_eq!(clean["truncated"], true);
        assert!(clean["message"].as_str().unwrap().contains("truncated"));
    }

    #[test]
    fn rewrites_absolute_home_paths() {
        let result = json!({"path": "/home/alice/project/secret/.env"});
        let clean = sanitize_tool_result(&result);
        assert_eq!(clean["path"], "secret/.env");

        let result = json!({"file_path": "/home/bob/app/src/main.rs"});
        let clean = sanitize_tool_result(&result);
        assert_eq!(clean["file_path"], "src/main.rs");
    }

    #[test]
    fn rewrites_legacy_client_paths() {
        let result = json!({"path": "/srv/data/clients/abc123/index.html"});
        let clean = sanitize_tool_result(&result);
        assert_eq!(clean["path"], "sandbox/index.html");
    }

    #[test]
    fn relative_paths_are_untouched() {
        let result = json!({"path": "src/lib.rs", "content": "fn main() {}"});
        let clean = sanitize_tool_result(&result);
        assert_eq!(clean, result);
    }

    #[test]
    fn raw_listing_with_internals_collapses_to_summary() {
        let result = json!([".git/objects/ab", ".git/objects/cd", "src/main.rs"]);
        let clean = sanitize_tool_result(&result);
        assert_eq!(clean["message"], "Operation completed.");
        assert_eq!(clean["items_processed"], 3);
    }

    #[test]
    fn clean_raw_listing_passes_through() {
        let result = json!(["a.txt", "b.txt"]);
        assert_eq!(sanitize_tool_result(&result), result);
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(sanitize_tool_result(&json!("done")), json!("done"));
        assert_eq!(sanitize_tool_result(&json!(42)), json!(42));
    }
}
