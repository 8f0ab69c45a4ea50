//! Buildpacks: per-language build/test commands and test-output parsers.
//!
//! Variants are tried in a fixed order and the first whose `detect` matches
//! wins.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{TestResults, SUITE_TEST};
use crate::sandbox::CommandOutput;

/// Commands for one detected project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub language: String,
    pub build_cmd: Vec<String>,
    pub test_cmd: Vec<String>,
    /// Prefix of the focused command; the buildpack appends the test names.
    pub focused_test_cmd: Vec<String>,
    /// Globs of source files, passed to planners and providers as hints.
    pub source_globs: Vec<String>,
}

pub trait Buildpack: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, path: &Path) -> bool;

    fn build_spec(&self, path: &Path) -> BuildSpec;

    /// Argv running only `tests`. Falls back to the full suite when no
    /// individual tests are known.
    fn focused_test_cmd(&self, spec: &BuildSpec, tests: &[String]) -> Vec<String> {
        let named: Vec<&String> = tests.iter().filter(|t| *t != SUITE_TEST).collect();
        if named.is_empty() {
            return spec.test_cmd.clone();
        }
        let mut argv = spec.focused_test_cmd.clone();
        argv.extend(named.into_iter().cloned());
        argv
    }

    fn parse_test_output(&self, output: &CommandOutput) -> TestResults;
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn any_exists(path: &Path, markers: &[&str]) -> bool {
    markers.iter().any(|m| path.join(m).exists())
}

/// Collect `(name, passed)` matches of `re` over both streams, falling back
/// to the exit code when nothing matched.
fn collect(output: &CommandOutput, re: &Regex, pass_words: &[&str]) -> TestResults {
    if output.timed_out {
        return TestResults::timed_out();
    }
    let mut passed = BTreeSet::new();
    let mut failed = BTreeSet::new();
    for line in output.stdout.lines().chain(output.stderr.lines()) {
        if let Some(caps) = re.captures(line.trim_end()) {
            let (Some(status), Some(name)) = (caps.name("status"), caps.name("name")) else {
                continue;
            };
            if pass_words.contains(&status.as_str()) {
                passed.insert(name.as_str().to_string());
            } else {
                failed.insert(name.as_str().to_string());
            }
        }
    }
    if passed.is_empty() && failed.is_empty() {
        return TestResults::aggregate(output.exit_code);
    }
    // a test reported both ways (retries) counts as failed
    passed.retain(|t| !failed.contains(t));
    TestResults {
        passed,
        failed,
        exit_code: output.exit_code,
        timed_out: false,
    }
}

/// Parser for libtest's `test name ... ok|FAILED` lines.
pub fn parse_libtest_output(output: &CommandOutput) -> TestResults {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^test (?P<name>\S+) \.\.\. (?P<status>ok|FAILED)$").expect("static regex")
    });
    collect(output, re, &["ok"])
}

// ---------------------------------------------------------------------------
// Built-in variants
// ---------------------------------------------------------------------------

pub struct CargoBuildpack;

impl Buildpack for CargoBuildpack {
    fn name(&self) -> &'static str {
        "cargo"
    }

    fn detect(&self, path: &Path) -> bool {
        any_exists(path, &["Cargo.toml"])
    }

    fn build_spec(&self, _path: &Path) -> BuildSpec {
        BuildSpec {
            language: "rust".into(),
            build_cmd: argv(&["cargo", "build", "--all-targets"]),
            test_cmd: argv(&["cargo", "test", "--no-fail-fast"]),
            focused_test_cmd: argv(&["cargo", "test", "--no-fail-fast", "--", "--exact"]),
            source_globs: argv(&["src/**", "tests/**", "Cargo.toml"]),
        }
    }

    fn parse_test_output(&self, output: &CommandOutput) -> TestResults {
        parse_libtest_output(output)
    }
}

pub struct PythonBuildpack;

impl Buildpack for PythonBuildpack {
    fn name(&self) -> &'static str {
        "python"
    }

    fn detect(&self, path: &Path) -> bool {
        any_exists(
            path,
            &["pyproject.toml", "setup.py", "pytest.ini", "requirements.txt"],
        )
    }

    fn build_spec(&self, _path: &Path) -> BuildSpec {
        BuildSpec {
            language: "python".into(),
            build_cmd: argv(&["python", "-m", "compileall", "-q", "."]),
            test_cmd: argv(&["python", "-m", "pytest", "-rA", "-q"]),
            focused_test_cmd: argv(&["python", "-m", "pytest", "-rA", "-q"]),
            source_globs: argv(&["**/*.py"]),
        }
    }

    fn parse_test_output(&self, output: &CommandOutput) -> TestResults {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^(?P<status>PASSED|FAILED|ERROR) (?P<name>\S+)").expect("static regex")
        });
        collect(output, re, &["PASSED"])
    }
}

pub struct NodeBuildpack;

impl Buildpack for NodeBuildpack {
    fn name(&self) -> &'static str {
        "node"
    }

    fn detect(&self, path: &Path) -> bool {
        any_exists(path, &["package.json"])
    }

    fn build_spec(&self, _path: &Path) -> BuildSpec {
        BuildSpec {
            language: "javascript".into(),
            build_cmd: argv(&["npm", "run", "build", "--if-present"]),
            test_cmd: argv(&["npm", "test", "--silent"]),
            focused_test_cmd: argv(&["npm", "test", "--silent", "--", "-t"]),
            source_globs: argv(&["src/**", "lib/**", "test/**", "package.json"]),
        }
    }

    fn focused_test_cmd(&self, spec: &BuildSpec, tests: &[String]) -> Vec<String> {
        let named: Vec<String> = tests
            .iter()
            .filter(|t| *t != SUITE_TEST)
            .map(|t| regex::escape(t))
            .collect();
        if named.is_empty() {
            return spec.test_cmd.clone();
        }
        let mut argv = spec.focused_test_cmd.clone();
        argv.push(named.join("|"));
        argv
    }

    fn parse_test_output(&self, output: &CommandOutput) -> TestResults {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^\s*(?P<status>✓|✕|√|×) (?P<name>.+?)(?: \(\d+ ?ms\))?$").expect("static regex")
        });
        // "√" is the Windows spelling of a pass
        collect(output, re, &["✓", "√"])
    }
}

pub struct GoBuildpack;

impl Buildpack for GoBuildpack {
    fn name(&self) -> &'static str {
        "go"
    }

    fn detect(&self, path: &Path) -> bool {
        any_exists(path, &["go.mod"])
    }

    fn build_spec(&self, _path: &Path) -> BuildSpec {
        BuildSpec {
            language: "go".into(),
            build_cmd: argv(&["go", "build", "./..."]),
            test_cmd: argv(&["go", "test", "-v", "./..."]),
            focused_test_cmd: argv(&["go", "test", "-v"]),
            source_globs: argv(&["**/*.go", "go.mod"]),
        }
    }

    fn focused_test_cmd(&self, spec: &BuildSpec, tests: &[String]) -> Vec<String> {
        let named: Vec<String> = tests
            .iter()
            .filter(|t| *t != SUITE_TEST)
            .map(|t| regex::escape(t))
            .collect();
        if named.is_empty() {
            return spec.test_cmd.clone();
        }
        let mut argv = spec.focused_test_cmd.clone();
        argv.push("-run".into());
        argv.push(format!("^({})$", named.join("|")));
        argv.push("./...".into());
        argv
    }

    fn parse_test_output(&self, output: &CommandOutput) -> TestResults {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^\s*--- (?P<status>PASS|FAIL): (?P<name>\S+)").expect("static regex")
        });
        collect(output, re, &["PASS"])
    }
}

/// Built-in buildpacks in detection order.
pub fn builtin_buildpacks() -> Vec<Arc<dyn Buildpack>> {
    vec![
        Arc::new(CargoBuildpack),
        Arc::new(PythonBuildpack),
        Arc::new(NodeBuildpack),
        Arc::new(GoBuildpack),
    ]
}

/// Resolve `selection` (`auto` or a buildpack name) for the project at `path`.
pub fn detect_buildpack(path: &Path, selection: &str) -> Option<Arc<dyn Buildpack>> {
    let packs = builtin_buildpacks();
    if selection.eq_ignore_ascii_case("auto") {
        packs.into_iter().find(|b| b.detect(path))
    } else {
        packs
            .into_iter()
            .find(|b| b.name().eq_ignore_ascii_case(selection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stdout: &str, exit_code: i32) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration_ms: 1,
            timed_out: false,
        }
    }

    #[test]
    fn detection_order_and_selection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_buildpack(dir.path(), "auto").is_none());
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(detect_buildpack(dir.path(), "auto").unwrap().name(), "cargo");
        assert_eq!(detect_buildpack(dir.path(), "node").unwrap().name(), "node");
        assert!(detect_buildpack(dir.path(), "cobol").is_none());
    }

    #[test]
    fn libtest_parser() {
        let out = output(
            "running 3 tests\ntest a::one ... ok\ntest a::two ... FAILED\ntest b ... ok\n",
            101,
        );
        let r = CargoBuildpack.parse_test_output(&out);
        assert_eq!(r.passed.len(), 2);
        assert!(r.failed.contains("a::two"));
        assert!(!r.all_passed());
    }

    #[test]
    fn pytest_and_go_parsers() {
        let py = PythonBuildpack.parse_test_output(&output(
            "PASSED tests/test_x.py::test_a\nFAILED tests/test_x.py::test_b - assert 1 == 2\n",
            1,
        ));
        assert!(py.passed.contains("tests/test_x.py::test_a"));
        assert!(py.failed.contains("tests/test_x.py::test_b"));

        let go = GoBuildpack.parse_test_output(&output(
            "=== RUN   TestA\n--- PASS: TestA (0.00s)\n--- FAIL: TestB (0.01s)\n",
            1,
        ));
        assert!(go.passed.contains("TestA"));
        assert!(go.failed.contains("TestB"));
    }

    #[test]
    fn unparseable_output_falls_back_to_exit_code() {
        let r = NodeBuildpack.parse_test_output(&output("some noise", 0));
        assert!(r.is_aggregate());
        assert!(r.all_passed());
    }

    #[test]
    fn focused_commands() {
        let spec = CargoBuildpack.build_spec(Path::new("."));
        let argv = CargoBuildpack.focused_test_cmd(&spec, &["a::two".to_string()]);
        assert_eq!(argv.last().unwrap(), "a::two");
        assert!(argv.contains(&"--exact".to_string()));
        // aggregate targets run the whole suite
        assert_eq!(
            CargoBuildpack.focused_test_cmd(&spec, &[SUITE_TEST.to_string()]),
            spec.test_cmd
        );

        let go_spec = GoBuildpack.build_spec(Path::new("."));
        let go = GoBuildpack.focused_test_cmd(&go_spec, &["TestA".into(), "TestB".into()]);
        assert!(go.contains(&"^(TestA|TestB)$".to_string()));
    }
}
