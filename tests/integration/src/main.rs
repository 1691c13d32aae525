//! Integration Test Harness
//!
//! Runs every scenario test binary in turn and prints a combined report.
//!
//! ```text
//! cargo run -p integration-tests
//! cargo test -p integration-tests --test circular_call_tests
//! RUST_LOG=comrt=debug cargo run -p integration-tests
//! ```

use std::process::{Command, ExitCode};
use std::time::{Duration, Instant};

/// (test binary, what it covers)
const SUITES: &[(&str, &str)] = &[
    ("apartment_tests", "MTA concurrency, STA serialization, deferred quit"),
    ("refcount_tests", "distributed lifetime across runtimes"),
    ("circular_call_tests", "callbacks into waiting apartments"),
    ("transport_tests", "object calls over ncalrpc and ncacn_ip_tcp"),
    ("stress_tests", "concurrent callers, marshal churn, STA bursts"),
];

const RULE: &str = "--------------------------------------------------------------------------------";

#[derive(Debug)]
enum Outcome {
    Passed,
    Failed(Option<i32>),
    Spawn(String),
}

#[derive(Debug)]
struct SuiteRun {
    suite: &'static str,
    outcome: Outcome,
    elapsed: Duration,
    passed: usize,
    failed: usize,
}

impl SuiteRun {
    fn ok(&self) -> bool {
        matches!(self.outcome, Outcome::Passed)
    }
}

/// Sum the counts from every `test result:` line libtest prints
fn parse_counts(stdout: &str) -> (usize, usize) {
    let count = |line: &str, label: &str| {
        line.split(';')
            .find_map(|part| part.trim().strip_suffix(label))
            .and_then(|n| n.trim().rsplit(' ').next())
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0)
    };
    stdout
        .lines()
        .filter(|line| line.starts_with("test result:"))
        .fold((0, 0), |(passed, failed), line| {
            (passed + count(line, "passed"), failed + count(line, "failed"))
        })
}

fn run_suite(suite: &'static str) -> SuiteRun {
    println!("\n>>> {}", suite);
    let started = Instant::now();
    let output = Command::new("cargo")
        .args(["test", "-p", "integration-tests", "--test", suite, "--", "--nocapture"])
        .output();
    let elapsed = started.elapsed();

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            return SuiteRun {
                suite,
                outcome: Outcome::Spawn(e.to_string()),
                elapsed,
                passed: 0,
                failed: 0,
            }
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    print!("{}", stdout);
    eprint!("{}", String::from_utf8_lossy(&output.stderr));

    let (passed, failed) = parse_counts(&stdout);
    let outcome = if output.status.success() {
        Outcome::Passed
    } else {
        Outcome::Failed(output.status.code())
    };
    SuiteRun {
        suite,
        outcome,
        elapsed,
        passed,
        failed,
    }
}

fn report(runs: &[SuiteRun], total: Duration) {
    println!("\n{}", RULE);
    println!("{:<24} {:<6} {:>7} {:>12}  notes", "suite", "status", "tests", "time");
    println!("{}", RULE);
    for run in runs {
        let status = if run.ok() { "ok" } else { "FAIL" };
        let notes = match &run.outcome {
            Outcome::Passed => String::new(),
            Outcome::Failed(code) => format!("exit code {:?}", code),
            Outcome::Spawn(e) => format!("could not run cargo: {}", e),
        };
        println!(
            "{:<24} {:<6} {:>7} {:>12}  {}",
            run.suite,
            status,
            format!("{}/{}", run.passed, run.passed + run.failed),
            format!("{:.2?}", run.elapsed),
            notes
        );
    }
    println!("{}", RULE);

    let passed: usize = runs.iter().map(|r| r.passed).sum();
    let failed: usize = runs.iter().map(|r| r.failed).sum();
    println!("{} passed, {} failed in {:.2?}", passed, failed, total);
}

fn main() -> ExitCode {
    println!("Object runtime integration suites:");
    for (suite, about) in SUITES {
        println!("  {:<24} {}", suite, about);
    }

    let started = Instant::now();
    let runs: Vec<SuiteRun> = SUITES.iter().map(|(suite, _)| run_suite(suite)).collect();
    report(&runs, started.elapsed());

    if runs.iter().all(SuiteRun::ok) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counts() {
        let stdout = "running 2 tests\n\
                      test result: ok. 2 passed; 0 failed; 0 ignored; 0 measured; 0 filtered out\n\
                      test result: FAILED. 3 passed; 1 failed; 0 ignored; 0 measured; 0 filtered out\n";
        assert_eq!(parse_counts(stdout), (5, 1));
        assert_eq!(parse_counts("no results"), (0, 0));
    }

    #[test]
    fn test_suites_have_test_targets() {
        let manifest = include_str!("../Cargo.toml");
        for (suite, _) in SUITES {
            assert!(manifest.contains(&format!("name = \"{}\"", suite)), "{} missing", suite);
        }
    }
}
