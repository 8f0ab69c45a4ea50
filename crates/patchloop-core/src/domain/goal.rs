//! Goal: the immutable description of what a run must achieve.

use std::collections::BTreeSet;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use super::error::{PatchloopError, Result};

/// Words dropped from goal text before computing a signature.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "be", "for", "in", "is", "it", "make", "of", "on", "or", "please",
    "so", "that", "the", "this", "to", "with",
];

/// Path constraints a candidate must respect. Patterns are compiled when
/// the constraints are built, so an invalid glob is a validation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConstraintPatterns", into = "ConstraintPatterns")]
pub struct GoalConstraints {
    allowed: Vec<PathPattern>,
    forbidden: Vec<PathPattern>,
}

/// Serialized form of [`GoalConstraints`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConstraintPatterns {
    /// Glob patterns of paths a patch may touch. Empty means unrestricted.
    #[serde(default)]
    allowed_paths: Vec<String>,
    /// Glob patterns of paths a patch must never touch.
    #[serde(default = "default_forbidden_patterns")]
    forbidden_patterns: Vec<String>,
}

fn default_forbidden_patterns() -> Vec<String> {
    [
        ".env",
        ".env.*",
        "*.pem",
        "*.key",
        "id_rsa*",
        "id_ed25519*",
        "*credentials*",
        "**/secrets/**",
        ".git/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for GoalConstraints {
    fn default() -> Self {
        Self::new(Vec::new(), default_forbidden_patterns()).expect("static globs")
    }
}

impl GoalConstraints {
    pub fn new(allowed_paths: Vec<String>, forbidden_patterns: Vec<String>) -> Result<Self> {
        Ok(Self {
            allowed: compile(&allowed_paths)?,
            forbidden: compile(&forbidden_patterns)?,
        })
    }

    /// Restrict patches to `allowed_paths`, keeping the default forbidden set.
    pub fn allowing(allowed_paths: Vec<String>) -> Result<Self> {
        Self::new(allowed_paths, default_forbidden_patterns())
    }

    pub fn allowed_paths(&self) -> Vec<String> {
        self.allowed.iter().map(|p| p.as_str().to_string()).collect()
    }

    pub fn forbidden_patterns(&self) -> Vec<String> {
        self.forbidden.iter().map(|p| p.as_str().to_string()).collect()
    }

    /// True when `path` is inside the allowed set (or the set is empty).
    pub fn is_allowed(&self, path: &str) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|p| p.matches(path))
    }

    /// First forbidden pattern `path` matches, if any.
    pub fn forbidden_match(&self, path: &str) -> Option<&str> {
        self.forbidden
            .iter()
            .find(|p| p.matches(path))
            .map(PathPattern::as_str)
    }
}

impl TryFrom<ConstraintPatterns> for GoalConstraints {
    type Error = PatchloopError;

    fn try_from(raw: ConstraintPatterns) -> Result<Self> {
        Self::new(raw.allowed_paths, raw.forbidden_patterns)
    }
}

impl From<GoalConstraints> for ConstraintPatterns {
    fn from(c: GoalConstraints) -> Self {
        Self {
            allowed_paths: c.allowed_paths(),
            forbidden_patterns: c.forbidden_patterns(),
        }
    }
}

fn compile(patterns: &[String]) -> Result<Vec<PathPattern>> {
    patterns.iter().map(|p| PathPattern::new(p)).collect()
}

/// The desired outcome of one run. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    intent: String,
    test_cmd: Vec<String>,
    constraints: GoalConstraints,
}

impl Goal {
    pub fn new(intent: impl Into<String>, test_cmd: Vec<String>) -> Result<Self> {
        Self::with_constraints(intent, test_cmd, GoalConstraints::default())
    }

    pub fn with_constraints(
        intent: impl Into<String>,
        test_cmd: Vec<String>,
        constraints: GoalConstraints,
    ) -> Result<Self> {
        let intent = intent.into();
        if intent.trim().is_empty() {
            return Err(PatchloopError::InvalidGoal("intent must not be empty".into()));
        }
        if test_cmd.is_empty() || test_cmd[0].trim().is_empty() {
            return Err(PatchloopError::InvalidGoal(
                "test command must not be empty".into(),
            ));
        }
        Ok(Self {
            intent,
            test_cmd,
            constraints,
        })
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn test_cmd(&self) -> &[String] {
        &self.test_cmd
    }

    pub fn constraints(&self) -> &GoalConstraints {
        &self.constraints
    }

    /// Normalized signature used as the plan cache key.
    pub fn signature(&self) -> GoalSignature {
        GoalSignature::from_text(&self.intent)
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Canonical form of goal text: lowercase, punctuation stripped, stop-words
/// dropped, unique tokens sorted and joined by single spaces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GoalSignature(String);

impl GoalSignature {
    pub fn from_text(text: &str) -> Self {
        let tokens = tokenize(text);
        Self(tokens.into_iter().collect::<Vec<_>>().join(" "))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tokens(&self) -> BTreeSet<&str> {
        self.0.split(' ').filter(|t| !t.is_empty()).collect()
    }

    /// Jaccard similarity over token sets. Two empty signatures are identical.
    pub fn similarity(&self, other: &GoalSignature) -> f64 {
        let a = self.tokens();
        let b = other.tokens();
        let union = a.union(&b).count();
        if union == 0 {
            return 1.0;
        }
        a.intersection(&b).count() as f64 / union as f64
    }
}

impl From<String> for GoalSignature {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for GoalSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect();
    lowered
        .split_whitespace()
        .filter(|t| !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Path globs
// ---------------------------------------------------------------------------

/// A compiled glob over repository-relative paths.
///
/// `*` and `?` never cross `/`; `**` matches any number of path segments.
/// A pattern without `/` is also tried against the file name, so `*.pem`
/// matches `certs/server.pem`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern(Pattern);

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        Pattern::new(pattern)
            .map(Self)
            .map_err(|e| PatchloopError::InvalidGoal(format!("invalid path pattern {pattern:?}: {e}")))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.0.matches_with(path, PATH_MATCH) {
            return true;
        }
        if self.0.as_str().contains('/') {
            return false;
        }
        path.rsplit('/')
            .next()
            .is_some_and(|name| self.0.matches_with(name, PATH_MATCH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_rejects_empty_intent_and_command() {
        assert!(Goal::new("  ", vec!["cargo".into()]).is_err());
        assert!(Goal::new("fix it", vec![]).is_err());
        assert!(Goal::new("fix it", vec!["cargo".into(), "test".into()]).is_ok());
    }

    #[test]
    fn signature_is_canonical() {
        let a = GoalSignature::from_text("Fix the failing test in parser!");
        let b = GoalSignature::from_text("fix   failing parser TEST");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "failing fix parser test");
    }

    #[test]
    fn similarity_is_jaccard() {
        let a = GoalSignature::from_text("fix failing parser test");
        let b = GoalSignature::from_text("fix failing lexer test");
        assert!((a.similarity(&b) - 0.6).abs() < 1e-9);
        assert_eq!(a.similarity(&a), 1.0);
    }

    fn matches(pattern: &str, path: &str) -> bool {
        PathPattern::new(pattern).unwrap().matches(path)
    }

    #[test]
    fn glob_semantics() {
        assert!(matches("src/**", "src/a/b.rs"));
        assert!(matches("src/*.rs", "src/lib.rs"));
        assert!(!matches("src/*.rs", "src/a/lib.rs"));
        assert!(matches("*.pem", "certs/server.pem"));
        assert!(matches(".env", "config/.env"));
        assert!(matches("**/secrets/**", "secrets/token"));
        assert!(matches("**/secrets/**", "app/secrets/token"));
        assert!(matches("id_rsa*", "home/id_rsa.pub"));
        assert!(!matches("src/**", "tests/a.rs"));
        assert!(matches("src/?.rs", "src/a.rs"));
        assert!(matches("src/[ab].rs", "src/b.rs"));
    }

    #[test]
    fn constraints_allow_and_forbid() {
        let c = GoalConstraints::allowing(vec!["src/**".into()]).unwrap();
        assert!(c.is_allowed("src/lib.rs"));
        assert!(!c.is_allowed("build.rs"));
        assert_eq!(c.forbidden_match("src/.env"), Some(".env"));
        assert!(c.forbidden_match("src/lib.rs").is_none());
    }

    #[test]
    fn invalid_pattern_is_a_validation_error() {
        let err = GoalConstraints::allowing(vec!["src/[".into()]).unwrap_err();
        assert!(matches!(err, PatchloopError::InvalidGoal(_)), "{err}");

        let parsed: std::result::Result<GoalConstraints, _> =
            serde_json::from_str(r#"{"forbidden_patterns": ["***"]}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn constraints_round_trip_through_their_pattern_lists() {
        let c: GoalConstraints = serde_json::from_str(r#"{"allowed_paths": ["src/**"]}"#).unwrap();
        assert_eq!(c.allowed_paths(), vec!["src/**".to_string()]);
        assert_eq!(c.forbidden_patterns(), GoalConstraints::default().forbidden_patterns());
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["allowed_paths"][0], "src/**");
    }
}
