//! Heuristic task decomposition.
//!
//! A description is partitioned into subtasks by one of several strategies.
//! Every strategy infers required capability tags from keywords and only ever
//! points dependencies at subtasks produced earlier in the same call, so the
//! result always resolves into an execution plan.

use crate::core::dag::DependencyGraph;
use crate::core::plan::ExecutionPlan;
use crate::core::subtask::{Subtask, SubtaskId};
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::debug;

/// File paths with a recognized extension, e.g. `src/api/user.rs`.
static FILE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9_][A-Za-z0-9_./-]*\.(rs|ts|tsx|js|jsx|py|go|java|rb|sql|toml|json|ya?ml|md|css|html|sh)\b")
        .unwrap()
});

/// Bulleted or numbered list items.
static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:[-*+]|\d+[.)])\s+(.+?)\s*$").unwrap());

/// Sentence and clause boundaries for free text.
static CLAUSE_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[.;\n]+|\s*,?\s+\bthen\b\s+").unwrap());

pub const DEFAULT_MAX_SUBTASKS: usize = 12;

/// Keyword to capability tag.
const CAPABILITY_KEYWORDS: &[(&str, &str)] = &[
    ("rust", "rust"),
    ("cargo", "rust"),
    ("typescript", "typescript"),
    ("javascript", "javascript"),
    ("react", "frontend"),
    ("frontend", "frontend"),
    ("ui", "frontend"),
    ("css", "frontend"),
    ("python", "python"),
    ("go", "go"),
    ("java", "java"),
    ("sql", "sql"),
    ("database", "database"),
    ("schema", "database"),
    ("migration", "database"),
    ("api", "api"),
    ("endpoint", "api"),
    ("backend", "backend"),
    ("server", "backend"),
    ("test", "testing"),
    ("tests", "testing"),
    ("testing", "testing"),
    ("deploy", "devops"),
    ("docker", "devops"),
    ("kubernetes", "devops"),
    ("pipeline", "devops"),
    ("docs", "documentation"),
    ("documentation", "documentation"),
    ("readme", "documentation"),
    ("auth", "security"),
    ("authentication", "security"),
    ("security", "security"),
];

/// Domains in dependency order, with the keywords that signal them.
const DOMAINS: &[(&str, &[&str])] = &[
    ("database", &["database", "schema", "sql", "migration", "table", "postgres"]),
    ("backend", &["backend", "api", "endpoint", "server", "service", "auth"]),
    ("frontend", &["frontend", "ui", "react", "page", "css", "component", "form"]),
    ("testing", &["test", "tests", "testing", "qa", "coverage"]),
    ("infrastructure", &["deploy", "docker", "kubernetes", "ci", "pipeline", "infra"]),
    ("documentation", &["docs", "documentation", "readme", "document"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DecompositionStrategy {
    /// File-based when the text names files, domain-based when it spans
    /// several domains, component-based otherwise.
    #[default]
    Auto,
    ComponentBased,
    DomainBased,
    FileBased,
}

impl DecompositionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecompositionStrategy::Auto => "auto",
            DecompositionStrategy::ComponentBased => "component-based",
            DecompositionStrategy::DomainBased => "domain-based",
            DecompositionStrategy::FileBased => "file-based",
        }
    }
}

impl std::fmt::Display for DecompositionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DecompositionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "auto" => Ok(DecompositionStrategy::Auto),
            "component-based" | "component" => Ok(DecompositionStrategy::ComponentBased),
            "domain-based" | "domain" => Ok(DecompositionStrategy::DomainBased),
            "file-based" | "file" => Ok(DecompositionStrategy::FileBased),
            _ => Err(Error::Validation(format!(
                "unknown decomposition strategy: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecomposeOptions {
    pub strategy: DecompositionStrategy,
    /// Upper bound on produced subtasks. Values below 1 act as 1.
    pub max_subtasks: usize,
}

impl Default for DecomposeOptions {
    fn default() -> Self {
        Self {
            strategy: DecompositionStrategy::Auto,
            max_subtasks: DEFAULT_MAX_SUBTASKS,
        }
    }
}

impl DecomposeOptions {
    pub fn with_strategy(strategy: DecompositionStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }
}

/// Subtasks with their dependency graph and precomputed levels.
#[derive(Debug)]
pub struct Decomposition {
    pub subtasks: Vec<Subtask>,
    pub graph: DependencyGraph<Subtask>,
    pub levels: ExecutionPlan,
    /// Concrete strategy that produced the subtasks (never `Auto`).
    pub strategy: DecompositionStrategy,
}

impl Decomposition {
    pub fn subtask(&self, id: &SubtaskId) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| &s.id == id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskDecomposer;

impl TaskDecomposer {
    pub fn new() -> Self {
        Self
    }

    /// Partition `description` into subtasks.
    ///
    /// Never returns an empty set: a blank description yields one subtask.
    pub fn decompose(&self, description: &str, options: &DecomposeOptions) -> Result<Decomposition> {
        let strategy = match options.strategy {
            DecompositionStrategy::Auto => choose_strategy(description),
            other => other,
        };

        let mut subtasks = match strategy {
            DecompositionStrategy::FileBased => by_file(description),
            DecompositionStrategy::DomainBased => by_domain(description),
            _ => by_component(description),
        };
        if subtasks.is_empty() {
            subtasks = vec![single(description)];
        }
        cap(&mut subtasks, options.max_subtasks.max(1));

        let graph = DependencyGraph::from_subtasks(subtasks.clone())?;
        let levels = graph.execution_plan()?;
        debug!(
            strategy = %strategy,
            subtasks = subtasks.len(),
            levels = levels.level_count(),
            "task decomposed"
        );
        Ok(Decomposition {
            subtasks,
            graph,
            levels,
            strategy,
        })
    }
}

fn choose_strategy(description: &str) -> DecompositionStrategy {
    if FILE_PATH_RE.is_match(description) {
        DecompositionStrategy::FileBased
    } else if detect_domains(description).len() >= 2 {
        DecompositionStrategy::DomainBased
    } else {
        DecompositionStrategy::ComponentBased
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Capability tags implied by keywords in `text`, in first-seen order.
pub fn infer_capabilities(text: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for word in words(text) {
        if let Some((_, tag)) = CAPABILITY_KEYWORDS.iter().find(|(kw, _)| *kw == word) {
            if !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
    }
    tags
}

fn single(description: &str) -> Subtask {
    let trimmed = description.trim();
    let title = if trimmed.is_empty() {
        "Complete task"
    } else {
        trimmed
    };
    Subtask::new("task-1", title)
        .with_description(trimmed)
        .with_required(infer_capabilities(trimmed))
}

/// Ordering phase of a component, used to derive dependencies.
fn phase_of(text: &str) -> u8 {
    let words = words(text);
    if mentions(&words, &["design", "plan", "spec", "research", "analyze"]) {
        0
    } else if mentions(&words, &["test", "tests", "testing", "verify", "validate", "qa"]) {
        2
    } else if mentions(&words, &["deploy", "release", "ship", "publish"]) {
        3
    } else if mentions(&words, &["document", "docs", "documentation", "readme"]) {
        4
    } else {
        1
    }
}

fn mentions(words: &[String], candidates: &[&str]) -> bool {
    words.iter().any(|w| candidates.contains(&w.as_str()))
}

fn clauses(description: &str) -> Vec<String> {
    let items: Vec<String> = LIST_ITEM_RE
        .captures_iter(description)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect();
    if !items.is_empty() {
        return items;
    }
    CLAUSE_SPLIT_RE
        .split(description)
        .map(str::trim)
        .filter(|c| c.chars().any(char::is_alphanumeric))
        .map(str::to_string)
        .collect()
}

/// One subtask per clause; each depends on every subtask of the nearest
/// earlier phase.
fn by_component(description: &str) -> Vec<Subtask> {
    let parts = clauses(description);
    let phases: Vec<u8> = parts.iter().map(|p| phase_of(p)).collect();

    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let id = format!("component-{}", i + 1);
            let earlier = phases[..i].iter().copied().filter(|p| *p < phases[i]).max();
            let deps: Vec<String> = match earlier {
                Some(phase) => (0..i)
                    .filter(|j| phases[*j] == phase)
                    .map(|j| format!("component-{}", j + 1))
                    .collect(),
                None => Vec::new(),
            };
            Subtask::new(id, part)
                .with_description(part)
                .with_required(infer_capabilities(part))
                .with_dependencies(deps)
        })
        .collect()
}

fn detect_domains(description: &str) -> Vec<&'static str> {
    let words: HashSet<String> = words(description).into_iter().collect();
    DOMAINS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| words.contains(*k)))
        .map(|(name, _)| *name)
        .collect()
}

/// One subtask per detected domain.
///
/// Data flows database, backend, frontend. Testing waits on every
/// implementation domain, infrastructure on testing, documentation on
/// everything implemented.
fn by_domain(description: &str) -> Vec<Subtask> {
    let found = detect_domains(description);
    let implementation = ["database", "backend", "frontend"];
    let present = |name: &str| found.iter().any(|f| *f == name);

    found
        .iter()
        .map(|&domain| {
            let deps: Vec<&str> = match domain {
                "backend" => vec!["database"],
                "frontend" => vec!["backend"],
                "testing" => implementation.to_vec(),
                "infrastructure" => {
                    if present("testing") {
                        vec!["testing"]
                    } else {
                        implementation.to_vec()
                    }
                }
                "documentation" => implementation.to_vec(),
                _ => Vec::new(),
            };
            let deps: Vec<&str> = deps.into_iter().filter(|d| present(*d)).collect();
            Subtask::new(domain, &format!("{} work", capitalize(domain)))
                .with_description(description.trim())
                .with_required([domain])
                .with_preferred(infer_capabilities(description))
                .with_dependencies(deps)
        })
        .collect()
}

/// One subtask per referenced file plus a verification step when several
/// files change together.
fn by_file(description: &str) -> Vec<Subtask> {
    let mut seen = HashSet::new();
    let files: Vec<&str> = FILE_PATH_RE
        .find_iter(description)
        .map(|m| m.as_str())
        .filter(|path| seen.insert(*path))
        .collect();

    let mut subtasks: Vec<Subtask> = files
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let mut required = Vec::new();
            if let Some(tag) = language_of(path) {
                required.push(tag);
            }
            Subtask::new(format!("file-{}", i + 1), &format!("Update {path}"))
                .with_description(path)
                .with_required(required)
        })
        .collect();

    if subtasks.len() > 1 {
        let deps: Vec<SubtaskId> = subtasks.iter().map(|s| s.id.clone()).collect();
        subtasks.push(
            Subtask::new("file-verify", "Verify changes")
                .with_description(description.trim())
                .with_required(["testing"])
                .with_dependencies(deps),
        );
    }
    subtasks
}

fn language_of(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?;
    let tag = match ext {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "sql" => "sql",
        "css" | "html" => "frontend",
        "md" => "documentation",
        "sh" | "yml" | "yaml" => "devops",
        _ => return None,
    };
    Some(tag)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Keep the first `max` subtasks and drop dependencies on the rest.
fn cap(subtasks: &mut Vec<Subtask>, max: usize) {
    if subtasks.len() <= max {
        return;
    }
    subtasks.truncate(max);
    let kept: HashSet<SubtaskId> = subtasks.iter().map(|s| s.id.clone()).collect();
    for subtask in subtasks.iter_mut() {
        subtask.dependencies.retain(|d| kept.contains(d));
    }
}
