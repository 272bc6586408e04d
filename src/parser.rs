//! Classification of streaming `xcodebuild` output.
//!
//! [`classify`] maps one line of build-tool output to at most one
//! [`XcodebuildLineEvent`]. It is a pure function over an ordered table of
//! `(pattern, extractor)` rules: the first pattern that matches wins and its
//! extractor builds the event from named capture groups. Lines no rule
//! matches are [`XcodebuildLineEvent::Undefined`].
//!
//! `xcodebuild` words its progress differently for serial and parallel
//! testing, and crashes have no single canonical line. Both quirks are
//! handled by adding rows to the table:
//!
//! | Event | Example line |
//! |-------|--------------|
//! | `SuiteStarted` | `Test Suite 'LoginTests' started at 2024-01-01 10:00:00.000` |
//! | `TestStarted` | `Test Case '-[AppUITests.LoginTests testLogin]' started.` |
//! | `TestStarted` | `Test case 'LoginTests.testLogin()' started on 'Clone 1 of iPhone 15'` |
//! | `TestPassed` | `Test Case '-[AppUITests.LoginTests testLogin]' passed (4.211 seconds).` |
//! | `TestFailed` | `Test case 'LoginTests.testLogin()' failed on 'Clone 1 of iPhone 15' (9.100 seconds)` |
//! | `TestCrashed` | `Restarting after unexpected exit, crash, or test timeout in ...` |
//! | `NoSpaceOnDevice` | `... No space left on device` |
//!
//! [`LineBuffer`] reassembles lines from chunks that may split anywhere, and
//! [`detect_environment_fault`] recognises output meaning the whole fleet is
//! unusable.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::test_case::TestCase;

/// Structured meaning of one line of output.
#[derive(Debug, Clone, PartialEq)]
pub enum XcodebuildLineEvent {
    SuiteStarted { suite: String },
    TestStarted(TestCase),
    /// Passed, with the tool's reported duration in seconds.
    TestPassed(f64),
    /// Failed, with the tool's reported duration in seconds.
    TestFailed(f64),
    TestCrashed,
    NoSpaceOnDevice,
    Undefined,
}

struct LineRule {
    pattern: Regex,
    extract: fn(&Captures<'_>) -> XcodebuildLineEvent,
}

fn rule(pattern: &str, extract: fn(&Captures<'_>) -> XcodebuildLineEvent) -> LineRule {
    LineRule {
        pattern: Regex::new(pattern).expect("line rule patterns are valid"),
        extract,
    }
}

fn capture(caps: &Captures<'_>, name: &str) -> String {
    caps.name(name)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn duration(caps: &Captures<'_>) -> f64 {
    caps.name("duration")
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0)
}

fn test_started(caps: &Captures<'_>) -> XcodebuildLineEvent {
    XcodebuildLineEvent::TestStarted(TestCase::new(
        capture(caps, "suite"),
        capture(caps, "name"),
    ))
}

static LINE_RULES: LazyLock<Vec<LineRule>> = LazyLock::new(|| {
    vec![
        rule(r"^\s*Test Suite '(?P<suite>[^']+)' started", |caps| {
            XcodebuildLineEvent::SuiteStarted {
                suite: capture(caps, "suite"),
            }
        }),
        // Serial: Test Case '-[Module.Suite testName]' started.
        rule(
            r"^\s*Test Case '-\[(?:\w+\.)?(?P<suite>\w+) (?P<name>\w+)\]' started",
            test_started,
        ),
        // Parallel: Test case 'Suite.testName()' started on 'Clone 1 of ...'
        rule(
            r"^\s*Test [Cc]ase '(?:\w+\.)?(?P<suite>\w+)\.(?P<name>\w+)\(\)' started",
            test_started,
        ),
        rule(
            r"^\s*Test Case '-\[[^\]]+\]' passed \((?P<duration>\d+(?:\.\d+)?) seconds\)",
            |caps| XcodebuildLineEvent::TestPassed(duration(caps)),
        ),
        rule(
            r"^\s*Test [Cc]ase '[^']+' passed on '[^']*' \((?P<duration>\d+(?:\.\d+)?) seconds\)",
            |caps| XcodebuildLineEvent::TestPassed(duration(caps)),
        ),
        rule(
            r"^\s*Test Case '-\[[^\]]+\]' failed \((?P<duration>\d+(?:\.\d+)?) seconds\)",
            |caps| XcodebuildLineEvent::TestFailed(duration(caps)),
        ),
        rule(
            r"^\s*Test [Cc]ase '[^']+' failed on '[^']*' \((?P<duration>\d+(?:\.\d+)?) seconds\)",
            |caps| XcodebuildLineEvent::TestFailed(duration(caps)),
        ),
        rule(r"(?i)restarting after unexpected exit", |_| {
            XcodebuildLineEvent::TestCrashed
        }),
        rule(r"(?i)encountered an error \(Crash:", |_| {
            XcodebuildLineEvent::TestCrashed
        }),
        rule(r"(?i)checking for crash reports", |_| {
            XcodebuildLineEvent::TestCrashed
        }),
        rule(r"(?i)no space left on device", |_| {
            XcodebuildLineEvent::NoSpaceOnDevice
        }),
        rule(r"(?i)not enough (?:free )?(?:disk )?space", |_| {
            XcodebuildLineEvent::NoSpaceOnDevice
        }),
    ]
});

/// Classifies one line of output.
///
/// Pure: the same line always yields the same event.
///
/// # Example
///
/// ```
/// use fleetrun::parser::{classify, XcodebuildLineEvent};
///
/// let event = classify("Test Case '-[AppUITests.LoginTests testLogin]' passed (4.211 seconds).");
/// assert_eq!(event, XcodebuildLineEvent::TestPassed(4.211));
///
/// assert_eq!(classify("** TEST EXECUTE SUCCEEDED **"), XcodebuildLineEvent::Undefined);
/// ```
pub fn classify(line: &str) -> XcodebuildLineEvent {
    LINE_RULES
        .iter()
        .find_map(|rule| rule.pattern.captures(line).map(|caps| (rule.extract)(&caps)))
        .unwrap_or(XcodebuildLineEvent::Undefined)
}

/// Output patterns that mean the fleet itself is broken rather than one
/// runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentFault {
    /// The test bundle or app on the node is corrupt or unsigned.
    DamagedBuildArtifacts,
    /// The test runner cannot drive the UI because accessibility/automation
    /// permission was never granted on the node.
    MissingAccessibilityPermission,
}

impl std::fmt::Display for EnvironmentFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentFault::DamagedBuildArtifacts => write!(f, "damaged build artifacts"),
            EnvironmentFault::MissingAccessibilityPermission => {
                write!(f, "missing accessibility permission")
            }
        }
    }
}

static FAULT_RULES: LazyLock<Vec<(Regex, EnvironmentFault)>> = LazyLock::new(|| {
    [
        (
            r"(?i)is damaged and can.t be opened",
            EnvironmentFault::DamagedBuildArtifacts,
        ),
        (
            r"(?i)the test runner failed to load",
            EnvironmentFault::DamagedBuildArtifacts,
        ),
        (
            r"(?i)code ?signature (?:is )?(?:invalid|not valid)",
            EnvironmentFault::DamagedBuildArtifacts,
        ),
        (
            r"(?i)timed out while enabling automation mode",
            EnvironmentFault::MissingAccessibilityPermission,
        ),
        (
            r"(?i)accessibility (?:permission|access) (?:is )?(?:not granted|denied|required)",
            EnvironmentFault::MissingAccessibilityPermission,
        ),
    ]
    .into_iter()
    .map(|(pattern, fault)| {
        (
            Regex::new(pattern).expect("fault patterns are valid"),
            fault,
        )
    })
    .collect()
});

/// Returns the environment fault a line reports, if any.
pub fn detect_environment_fault(line: &str) -> Option<EnvironmentFault> {
    FAULT_RULES
        .iter()
        .find(|(pattern, _)| pattern.is_match(line))
        .map(|(_, fault)| *fault)
}

/// Longest partial line [`LineBuffer`] holds before emitting it as a line.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Reassembles complete lines from chunks that may split anywhere.
///
/// The trailing partial line of each chunk is kept and prepended to the
/// next one. A partial line longer than [`MAX_LINE_BYTES`] is emitted as is.
///
/// # Example
///
/// ```
/// use fleetrun::parser::LineBuffer;
///
/// let mut buffer = LineBuffer::default();
/// assert_eq!(buffer.push("Test Suite 'A' sta"), Vec::<String>::new());
/// assert_eq!(buffer.push("rted\nTest"), vec!["Test Suite 'A' started"]);
/// assert_eq!(buffer.finish(), Some("Test".to_string()));
/// ```
#[derive(Debug, Default)]
pub struct LineBuffer {
    remainder: String,
}

impl LineBuffer {
    /// Appends a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.remainder.push_str(chunk);

        let mut lines = Vec::new();
        if let Some(last_newline) = self.remainder.rfind('\n') {
            let rest = self.remainder.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut self.remainder, rest);
            lines.extend(
                complete
                    .lines()
                    .map(|line| line.trim_end_matches('\r').to_string()),
            );
        }

        if self.remainder.len() > MAX_LINE_BYTES {
            lines.push(std::mem::take(&mut self.remainder));
        }
        lines
    }

    /// Returns the buffered partial line, if any, leaving the buffer empty.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.remainder);
        if rest.is_empty() { None } else { Some(rest) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_started() {
        assert_eq!(
            classify("Test Suite 'LoginTests' started at 2024-01-01 10:00:00.000"),
            XcodebuildLineEvent::SuiteStarted {
                suite: "LoginTests".to_string()
            }
        );
    }

    #[test]
    fn test_serial_lifecycle() {
        assert_eq!(
            classify("Test Case '-[AppUITests.LoginTests testLogin]' started."),
            XcodebuildLineEvent::TestStarted(TestCase::new("LoginTests", "testLogin"))
        );
        assert_eq!(
            classify("Test Case '-[LoginTests testLogin]' started."),
            XcodebuildLineEvent::TestStarted(TestCase::new("LoginTests", "testLogin"))
        );
        assert_eq!(
            classify("Test Case '-[AppUITests.LoginTests testLogin]' passed (4.211 seconds)."),
            XcodebuildLineEvent::TestPassed(4.211)
        );
        assert_eq!(
            classify("Test Case '-[AppUITests.LoginTests testLogin]' failed (12 seconds)."),
            XcodebuildLineEvent::TestFailed(12.0)
        );
    }

    #[test]
    fn test_parallel_lifecycle() {
        assert_eq!(
            classify("Test case 'LoginTests.testLogin()' started on 'Clone 1 of iPhone 15 - App (4242)'"),
            XcodebuildLineEvent::TestStarted(TestCase::new("LoginTests", "testLogin"))
        );
        assert_eq!(
            classify("Test case 'LoginTests.testLogin()' passed on 'Clone 1 of iPhone 15 - App (4242)' (3.500 seconds)"),
            XcodebuildLineEvent::TestPassed(3.5)
        );
        assert_eq!(
            classify("Test case 'LoginTests.testLogin()' failed on 'Clone 1 of iPhone 15 - App (4242)' (9.100 seconds)"),
            XcodebuildLineEvent::TestFailed(9.1)
        );
    }

    #[test]
    fn test_crash_patterns() {
        for line in [
            "Restarting after unexpected exit, crash, or test timeout in LoginTests.testLogin(); summary will include totals from previous launches.",
            "LoginTests.testLogin() encountered an error (Crash: App (4242) EXC_BAD_ACCESS)",
            "Checking for crash reports corresponding to unexpected termination of App (4242)",
        ] {
            assert_eq!(classify(line), XcodebuildLineEvent::TestCrashed, "{}", line);
        }
    }

    #[test]
    fn test_no_space_on_device() {
        assert_eq!(
            classify("Failed to install app: No space left on device"),
            XcodebuildLineEvent::NoSpaceOnDevice
        );
        assert_eq!(
            classify("There is not enough disk space available to install the product."),
            XcodebuildLineEvent::NoSpaceOnDevice
        );
    }

    #[test]
    fn test_undefined() {
        assert_eq!(classify(""), XcodebuildLineEvent::Undefined);
        assert_eq!(
            classify("    t =     2.34s Tap \"Login\" Button"),
            XcodebuildLineEvent::Undefined
        );
        assert_eq!(
            classify("Test Suite 'All tests' passed at 2024-01-01 10:00:00.000."),
            XcodebuildLineEvent::Undefined
        );
    }

    #[test]
    fn test_classify_is_deterministic() {
        let lines = [
            "Test Case '-[AppUITests.LoginTests testLogin]' started.",
            "Restarting after unexpected exit",
            "random noise",
        ];
        let first: Vec<_> = lines.iter().map(|l| classify(l)).collect();
        let second: Vec<_> = lines.iter().rev().map(|l| classify(l)).collect();
        assert_eq!(first, second.into_iter().rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_environment_faults() {
        assert_eq!(
            detect_environment_fault("\"App.app\" is damaged and can't be opened."),
            Some(EnvironmentFault::DamagedBuildArtifacts)
        );
        assert_eq!(
            detect_environment_fault("Timed out while enabling automation mode."),
            Some(EnvironmentFault::MissingAccessibilityPermission)
        );
        assert_eq!(detect_environment_fault("Test Suite 'A' started"), None);
    }

    #[test]
    fn test_line_buffer_reassembles_split_lines() {
        let mut buffer = LineBuffer::default();

        assert!(buffer.push("Test Case '-[A.B ").is_empty());
        assert!(buffer.push("test]' st").is_empty());
        assert_eq!(
            buffer.push("arted.\r\nnext line\npar"),
            vec!["Test Case '-[A.B test]' started.", "next line"]
        );
        assert_eq!(buffer.push("tial\n"), vec!["partial"]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_line_buffer_keeps_empty_lines() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push("a\n\nb\n"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_line_buffer_emits_overlong_partial_line() {
        let mut buffer = LineBuffer::default();
        let long = "x".repeat(MAX_LINE_BYTES);
        assert!(buffer.push(&long).is_empty());

        let lines = buffer.push("yz");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES + 2);
        assert_eq!(buffer.finish(), None);

        assert_eq!(buffer.push("next\n"), vec!["next"]);
    }
}
