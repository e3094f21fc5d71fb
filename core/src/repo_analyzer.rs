use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_json::json;

use crate::Result;
use crate::config::now_rfc3339;

const MAX_DEPTH: usize = 10;
const MAX_FILES: usize = 1000;
const LARGE_FILE_BYTES: u64 = 1024 * 1024;
const DEBT_SCAN_CAP_BYTES: u64 = 256 * 1024;

const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    "venv",
];

/// Read-only analysis of a repository the path validator already cleared.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RepoAnalysis {
    pub repo_path: String,
    pub structure: JsonValue,
    pub stack: JsonValue,
    pub summary: String,
    pub tech_debt: Vec<String>,
    pub analyzed_at: String,
    pub file_count: usize,
    pub total_size: u64,
}

struct Walk {
    files: Vec<(String, u64)>,
    languages: BTreeMap<String, usize>,
    markers: Vec<String>,
    total_size: u64,
    truncated: bool,
    has_readme: bool,
    has_tests: bool,
}

/// Walks the tree (depth ≤ 10, ≤ 1000 files, well-known build dirs
/// skipped), detects the language mix and frameworks, and derives a summary
/// plus tech-debt findings.
pub fn analyze_repository(root: &Path) -> Result<RepoAnalysis> {
    let mut walk = Walk {
        files: Vec::new(),
        languages: BTreeMap::new(),
        markers: Vec::new(),
        total_size: 0,
        truncated: false,
        has_readme: false,
        has_tests: false,
    };
    scan(root, root, 0, &mut walk)?;

    let frameworks = detect_frameworks(&walk.markers);
    let tech_debt = detect_tech_debt_inner(root, &walk);

    let structure = json!({
        "file_count": walk.files.len(),
        "total_size": walk.total_size,
        "truncated": walk.truncated,
        "languages": walk.languages,
    });
    let stack = json!({
        "languages": walk.languages,
        "frameworks": frameworks,
    });
    let summary = build_summary(root, &walk, &frameworks);

    Ok(RepoAnalysis {
        repo_path: root.display().to_string(),
        structure,
        stack,
        summary,
        tech_debt,
        analyzed_at: now_rfc3339(),
        file_count: walk.files.len(),
        total_size: walk.total_size,
    })
}

fn scan(root: &Path, dir: &Path, depth: usize, walk: &mut Walk) -> Result<()> {
    if depth > MAX_DEPTH || walk.files.len() >= MAX_FILES {
        walk.truncated = true;
        return Ok(());
    }
    for entry in fs::read_dir(dir)?.flatten() {
        if walk.files.len() >= MAX_FILES {
            walk.truncated = true;
            return Ok(());
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if SKIP_DIRS.contains(&name.as_str()) {
                continue;
            }
            if name.eq_ignore_ascii_case("tests") || name.eq_ignore_ascii_case("test") {
                walk.has_tests = true;
            }
            scan(root, &path, depth + 1, walk)?;
        } else if path.is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            walk.total_size += size;
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .display()
                .to_string();
            if name.to_ascii_lowercase().starts_with("readme") {
                walk.has_readme = true;
            }
            walk.markers.push(name.clone());
            if let Some(language) = language_for_extension(&path) {
                *walk.languages.entry(language.to_string()).or_insert(0) += 1;
            }
            walk.files.push((rel, size));
        }
    }
    Ok(())
}

fn language_for_extension(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "rs" => Some("Rust"),
        "py" => Some("Python"),
        "js" | "jsx" => Some("JavaScript"),
        "ts" | "tsx" => Some("TypeScript"),
        "go" => Some("Go"),
        "java" => Some("Java"),
        "c" | "h" => Some("C"),
        "cpp" | "cc" | "hpp" => Some("C++"),
        "cs" => Some("C#"),
        "rb" => Some("Ruby"),
        "php" => Some("PHP"),
        "swift" => Some("Swift"),
        "kt" => Some("Kotlin"),
        "sh" | "bash" => Some("Shell"),
        "html" => Some("HTML"),
        "css" | "scss" => Some("CSS"),
        "sql" => Some("SQL"),
        _ => None,
    }
}

fn detect_frameworks(markers: &[String]) -> Vec<String> {
    let has = |name: &str| markers.iter().any(|m| m == name);
    let mut frameworks = Vec::new();
    if has("Cargo.toml") {
        frameworks.push("cargo".to_string());
    }
    if has("package.json") {
        frameworks.push("node".to_string());
    }
    if has("next.config.js") || has("next.config.ts") {
        frameworks.push("nextjs".to_string());
    }
    if has("angular.json") {
        frameworks.push("angular".to_string());
    }
    if has("manage.py") {
        frameworks.push("django".to_string());
    }
    if has("pom.xml") || has("build.gradle") {
        frameworks.push("jvm".to_string());
    }
    if has("tauri.conf.json") {
        frameworks.push("tauri".to_string());
    }
    if has("Gemfile") {
        frameworks.push("rails".to_string());
    }
    if has("composer.json") {
        frameworks.push("laravel".to_string());
    }
    if has("go.mod") {
        frameworks.push("go-modules".to_string());
    }
    frameworks
}

fn build_summary(root: &Path, walk: &Walk, frameworks: &[String]) -> String {
    let dominant = walk
        .languages
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(language, _)| language.as_str())
        .unwrap_or("unknown");
    let mut summary = format!(
        "{}: {} files ({} bytes), mainly {dominant}",
        root.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string()),
        walk.files.len(),
        walk.total_size,
    );
    if !frameworks.is_empty() {
        summary.push_str(&format!("; tooling: {}", frameworks.join(", ")));
    }
    if walk.truncated {
        summary.push_str(" (scan truncated)");
    }
    summary
}

fn detect_tech_debt_inner(root: &Path, walk: &Walk) -> Vec<String> {
    let mut debt = Vec::new();
    if !walk.has_readme {
        debt.push("No README found".to_string());
    }
    if !walk.has_tests {
        debt.push("No tests directory found".to_string());
    }
    for (rel, size) in &walk.files {
        if *size > LARGE_FILE_BYTES {
            debt.push(format!("Very large file: {rel} ({size} bytes)"));
        }
    }
    let mut todo_count = 0usize;
    for (rel, size) in &walk.files {
        if *size > DEBT_SCAN_CAP_BYTES {
            continue;
        }
        let path = root.join(rel);
        if language_for_extension(&path).is_none() {
            continue;
        }
        if let Ok(content) = fs::read_to_string(&path) {
            todo_count += content.matches("TODO").count() + content.matches("FIXME").count();
        }
    }
    if todo_count > 20 {
        debt.push(format!("High TODO/FIXME density: {todo_count} markers"));
    }
    debt
}
