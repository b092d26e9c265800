//! Best-effort crash report recognition for reproduce runs.
//!
//! Reports are recognized by their header line. The first recognized header
//! in the combined output wins; the first `#0` frame after it is the crash
//! signature.

use serde::{Deserialize, Serialize};

use crate::config::Language;
use crate::sanitizer::Sanitizer;

/// Which runtime produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    Address,
    Leak,
    Memory,
    UndefinedBehavior,
    Thread,
    LibFuzzer,
    Jazzer,
    /// The worker failed but printed nothing we recognize.
    Unknown,
}

/// A recognized crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub kind: ReportKind,
    /// The report's header line, e.g. `ERROR: AddressSanitizer: heap-buffer-overflow ...`.
    pub summary: String,
    /// Function and location of the innermost frame, when present.
    pub top_frame: Option<String>,
    /// How the harness was invoked, when the runner echoed it.
    pub repro_command: Option<ReproCommand>,
}

impl CrashReport {
    /// A report for a failing run without any recognizable output.
    pub fn unknown(output: &str) -> Self {
        let summary = output
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("worker exited with a failure status")
            .to_string();
        Self {
            kind: ReportKind::Unknown,
            summary,
            top_frame: None,
            repro_command: extract_repro_command(output),
        }
    }

    /// Short human-readable signature.
    pub fn signature(&self) -> String {
        match &self.top_frame {
            Some(frame) => format!("{} at {}", self.summary, frame),
            None => self.summary.clone(),
        }
    }
}

const PATTERNS: &[(&str, ReportKind)] = &[
    ("ERROR: AddressSanitizer:", ReportKind::Address),
    ("ERROR: LeakSanitizer:", ReportKind::Leak),
    ("WARNING: MemorySanitizer:", ReportKind::Memory),
    ("ERROR: UndefinedBehaviorSanitizer:", ReportKind::UndefinedBehavior),
    ("runtime error:", ReportKind::UndefinedBehavior),
    ("WARNING: ThreadSanitizer:", ReportKind::Thread),
    ("== Java Exception:", ReportKind::Jazzer),
    ("ERROR: libFuzzer:", ReportKind::LibFuzzer),
];

/// Looks for a crash report in a reproduce run's output.
///
/// Reports from the selected sanitizer are preferred; any other recognized
/// report (including libFuzzer's own deadly-signal, timeout and OOM reports)
/// is the fallback. JVM projects additionally recognize Jazzer exceptions.
pub fn parse_crash(
    stdout: &str,
    stderr: &str,
    sanitizer: Sanitizer,
    language: Language,
) -> Option<CrashReport> {
    let combined = strip_ansi(&format!("{}\n{}", stderr, stdout));
    let lines: Vec<&str> = combined.lines().collect();

    let preferred = preferred_kinds(sanitizer);
    let candidates = PATTERNS
        .iter()
        .filter(|(_, kind)| *kind != ReportKind::Jazzer || language == Language::Jvm);

    let mut found: Option<(usize, ReportKind)> = None;
    for (index, line) in lines.iter().enumerate() {
        let Some((_, kind)) = candidates.clone().find(|(needle, _)| line.contains(needle)) else {
            continue;
        };
        let better = match found {
            None => true,
            Some((_, current)) => !preferred.contains(&current) && preferred.contains(kind),
        };
        if better {
            found = Some((index, *kind));
        }
        if preferred.contains(kind) {
            break;
        }
    }

    let (index, kind) = found?;
    Some(CrashReport {
        kind,
        summary: report_summary(lines[index]),
        top_frame: top_frame(&lines[index..]),
        repro_command: extract_repro_command(&combined),
    })
}

fn preferred_kinds(sanitizer: Sanitizer) -> &'static [ReportKind] {
    match sanitizer {
        Sanitizer::Address => &[ReportKind::Address, ReportKind::Leak],
        Sanitizer::Memory => &[ReportKind::Memory],
        Sanitizer::UndefinedBehavior => &[ReportKind::UndefinedBehavior],
        Sanitizer::Coverage => &[],
    }
}

fn report_summary(line: &str) -> String {
    let line = line.trim();
    // Drop the "==1234==" pid prefix sanitizers put in front of the header.
    match line.strip_prefix("==") {
        Some(rest) => match rest.find("==") {
            Some(end) if rest[..end].chars().all(|c| c.is_ascii_digit()) => {
                rest[end + 2..].trim().to_string()
            }
            _ => line.to_string(),
        },
        None => line.to_string(),
    }
}

/// `#0 0x4f1c2a in parse_header /src/proj/parse.c:42:7` → `parse_header /src/proj/parse.c:42:7`
fn top_frame(lines: &[&str]) -> Option<String> {
    lines.iter().find_map(|line| {
        let rest = line.trim_start().strip_prefix("#0 ")?;
        let rest = rest.trim_start();
        let rest = match rest.find(" in ") {
            Some(pos) if rest.starts_with("0x") => &rest[pos + 4..],
            _ => rest,
        };
        Some(rest.trim().to_string())
    })
}

/// Removes ANSI color escape sequences.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// A harness invocation that can be re-run against `/testcase` outside the
/// fuzzing loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReproCommand {
    /// Worker path of the harness binary, under `/out`.
    pub program: String,
    pub args: Vec<String>,
}

impl ReproCommand {
    pub fn to_command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

const DROPPED_FLAGS: &[&str] = &[
    "-timeout=",
    "-dict=",
    "-conf=",
    "-data_flow_trace=",
    "-runs=",
    "-jobs=",
    "-workers=",
    "-artifact_prefix=",
    "-print_final_stats",
];

/// Finds the first `/out/<harness> <args>` line in runner output and keeps
/// only the arguments that matter for a single replay.
///
/// `-rss_limit_mb=` and positional arguments survive; fuzzing-loop flags
/// are dropped and the testcase path is appended.
pub fn extract_repro_command(output: &str) -> Option<ReproCommand> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("/out/") && line.contains(char::is_whitespace))?;

    let mut parts = line.split_whitespace();
    let program = parts.next()?.to_string();

    let mut args: Vec<String> = parts
        .filter(|arg| {
            if arg.starts_with("-rss_limit_mb=") {
                return true;
            }
            if DROPPED_FLAGS.iter().any(|flag| arg.starts_with(flag)) {
                return false;
            }
            !arg.starts_with('-')
        })
        .filter(|arg| *arg != crate::paths::WORKER_TESTCASE)
        .map(str::to_string)
        .collect();
    args.push(crate::paths::WORKER_TESTCASE.to_string());

    Some(ReproCommand { program, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASAN: &str = "\
INFO: Running with entropic power schedule (0xFF, 100).
/out/fuzz_parse -rss_limit_mb=2560 -timeout=25 -runs=100 /testcase -dict=/out/fuzz_parse.dict
=================================================================
==17==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x602000000011
READ of size 1 at 0x602000000011 thread T0
    #0 0x55d4c1 in parse_header /src/demo/parse.c:42:7
    #1 0x55d7e0 in LLVMFuzzerTestOneInput /src/demo/fuzz.c:9:3
SUMMARY: AddressSanitizer: heap-buffer-overflow /src/demo/parse.c:42:7 in parse_header
";

    #[test]
    fn address_sanitizer_report_is_recognized() {
        let report = parse_crash("", ASAN, Sanitizer::Address, Language::CLike)
            .expect("report should be found");

        assert_eq!(report.kind, ReportKind::Address);
        assert!(report.summary.starts_with("ERROR: AddressSanitizer: heap-buffer-overflow"));
        assert_eq!(
            report.top_frame.as_deref(),
            Some("parse_header /src/demo/parse.c:42:7")
        );
    }

    #[test]
    fn clean_output_has_no_report() {
        let output = "INFO: Seed: 1\nExecuted /testcase in 2 ms\n";
        assert!(parse_crash(output, "", Sanitizer::Address, Language::CLike).is_none());
    }

    #[test]
    fn selected_sanitizer_report_wins_over_libfuzzer() {
        let output = "\
==9== ERROR: libFuzzer: deadly signal
src/x.c:3:5: runtime error: signed integer overflow
    #0 0x1 in add /src/x.c:3:5
";
        let report = parse_crash(output, "", Sanitizer::UndefinedBehavior, Language::CLike)
            .unwrap();
        assert_eq!(report.kind, ReportKind::UndefinedBehavior);
        assert_eq!(report.top_frame.as_deref(), Some("add /src/x.c:3:5"));

        let fallback = parse_crash(output, "", Sanitizer::Memory, Language::CLike).unwrap();
        assert_eq!(fallback.kind, ReportKind::LibFuzzer);
    }

    #[test]
    fn jazzer_reports_only_for_jvm_projects() {
        let output = "== Java Exception: java.lang.ArrayIndexOutOfBoundsException\n";
        assert!(parse_crash(output, "", Sanitizer::Address, Language::CLike).is_none());
        let report = parse_crash(output, "", Sanitizer::Address, Language::Jvm).unwrap();
        assert_eq!(report.kind, ReportKind::Jazzer);
    }

    #[test]
    fn ansi_colors_are_ignored() {
        let colored = "\u{1b}[1m\u{1b}[31m==3==ERROR: AddressSanitizer: SEGV\u{1b}[0m\n";
        assert_eq!(strip_ansi("\u{1b}[31mred\u{1b}[0m"), "red");
        let report = parse_crash("", colored, Sanitizer::Address, Language::CLike).unwrap();
        assert_eq!(report.summary, "ERROR: AddressSanitizer: SEGV");
    }

    #[test]
    fn repro_command_keeps_only_replay_flags() {
        let command = extract_repro_command(ASAN).unwrap();
        assert_eq!(command.program, "/out/fuzz_parse");
        assert_eq!(command.args, vec!["-rss_limit_mb=2560", "/testcase"]);
        assert_eq!(
            command.to_command_line(),
            "/out/fuzz_parse -rss_limit_mb=2560 /testcase"
        );
    }

    #[test]
    fn unknown_report_uses_last_output_line() {
        let report = CrashReport::unknown("starting\nSegmentation fault\n\n");
        assert_eq!(report.kind, ReportKind::Unknown);
        assert_eq!(report.summary, "Segmentation fault");
        assert_eq!(report.signature(), "Segmentation fault");
    }
}
