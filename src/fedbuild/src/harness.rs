//! Test drivers implement [`Runnable`] and report through [`run_main`]; the
//! test node reads the report lines back with [`parse_line`].
//!
//! A report line looks like `TEST <name> PASS|FAIL|PANIC|TIMEOUT|CRASH [detail]`.
//!
//! The line format is the whole contract with the test node. A driver compiled
//! on its own, without this crate, only has to print such lines; see
//! `demos/repository/src/test_calc.rs` for one that mirrors [`Runnable`].
use std::panic::{catch_unwind, AssertUnwindSafe};

pub const PREFIX: &str = "TEST";

/// A self-contained probe. `run` returns whether the probe passed.
pub trait Runnable {
    fn name(&self) -> String;
    fn run(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Panic,
    Timeout,
    Crash,
}

impl Verdict {
    fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Panic => "PANIC",
            Verdict::Timeout => "TIMEOUT",
            Verdict::Crash => "CRASH",
        }
    }
}

impl std::str::FromStr for Verdict {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PASS" => Verdict::Pass,
            "FAIL" => Verdict::Fail,
            "PANIC" => Verdict::Panic,
            "TIMEOUT" => Verdict::Timeout,
            "CRASH" => Verdict::Crash,
            _ => anyhow::bail!("unknown verdict: {}", s),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub name: String,
    pub verdict: Verdict,
    pub detail: String,
}

impl Report {
    pub fn new(name: &str, verdict: Verdict, detail: impl Into<String>) -> Self {
        Report {
            name: name.split_whitespace().collect::<Vec<_>>().join("_"),
            verdict,
            detail: detail.into().replace('\n', " "),
        }
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", PREFIX, self.name, self.verdict.as_str())?;
        if !self.detail.is_empty() {
            write!(f, " {}", self.detail)?;
        }
        Ok(())
    }
}

/// Reads one report line. Other output is not a report.
pub fn parse_line(line: &str) -> Option<Report> {
    let mut fields = line.trim().splitn(4, ' ');
    if fields.next()? != PREFIX {
        return None;
    }
    let name = fields.next()?;
    let verdict = fields.next()?.parse().ok()?;
    let detail = fields.next().unwrap_or("");
    Some(Report::new(name, verdict, detail))
}

/// Invokes every probe on its own, so one panicking probe does not hide the others.
pub fn run_registered(tests: &[Box<dyn Runnable>]) -> Vec<Report> {
    tests
        .iter()
        .map(|t| {
            let name = t.name();
            match catch_unwind(AssertUnwindSafe(|| t.run())) {
                Ok(true) => Report::new(&name, Verdict::Pass, ""),
                Ok(false) => Report::new(&name, Verdict::Fail, ""),
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    Report::new(&name, Verdict::Panic, detail)
                }
            }
        })
        .collect()
}

/// Entry point for a test driver binary: prints the reports and returns the exit code.
pub fn run_main(tests: &[Box<dyn Runnable>]) -> i32 {
    let reports = run_registered(tests);
    for r in &reports {
        println!("{}", r);
    }
    if reports.iter().all(|r| r.verdict == Verdict::Pass) {
        0
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(&'static str, Option<bool>);

    impl Runnable for Probe {
        fn name(&self) -> String {
            self.0.to_owned()
        }
        fn run(&self) -> bool {
            match self.1 {
                Some(b) => b,
                None => panic!("divide by zero"),
            }
        }
    }

    #[test]
    fn each_probe_is_isolated() {
        let tests: Vec<Box<dyn Runnable>> = vec![
            Box::new(Probe("adds", Some(true))),
            Box::new(Probe("divides", None)),
            Box::new(Probe("subtracts", Some(false))),
        ];
        let reports = run_registered(&tests);
        let verdicts: Vec<Verdict> = reports.iter().map(|r| r.verdict).collect();
        assert_eq!(verdicts, vec![Verdict::Pass, Verdict::Panic, Verdict::Fail]);
        assert_eq!(reports[1].detail, "divide by zero");
        assert_eq!(run_main(&tests), 1);
    }

    #[test]
    fn line_format() {
        let r = Report::new("big sum", Verdict::Panic, "overflow\nat line 3");
        let line = r.to_string();
        assert_eq!(line, "TEST big_sum PANIC overflow at line 3");
        assert_eq!(parse_line(&line), Some(r));
        assert_eq!(
            parse_line("TEST adds PASS"),
            Some(Report::new("adds", Verdict::Pass, ""))
        );
        assert_eq!(parse_line("compiling..."), None);
        assert_eq!(parse_line("TEST adds MAYBE"), None);
        assert_eq!(parse_line("TEST"), None);
    }
}
