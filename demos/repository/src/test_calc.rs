// Compiled on its own by the worker; calc.rs sits next to it in the session directory.
// Mirrors fedbuild::harness: one Runnable per probe, one `TEST` line per probe.
#[path = "calc.rs"]
mod calc;

use std::panic::{catch_unwind, AssertUnwindSafe};

trait Runnable {
    fn name(&self) -> String;
    fn run(&self) -> bool;
}

struct Probe(&'static str, fn() -> bool);

impl Runnable for Probe {
    fn name(&self) -> String {
        self.0.to_owned()
    }

    fn run(&self) -> bool {
        (self.1)()
    }
}

fn run_registered(tests: &[Box<dyn Runnable>]) -> bool {
    let mut all_passed = true;
    for t in tests {
        let verdict = match catch_unwind(AssertUnwindSafe(|| t.run())) {
            Ok(true) => "PASS",
            Ok(false) => "FAIL",
            Err(_) => "PANIC",
        };
        all_passed &= verdict == "PASS";
        println!("TEST {} {}", t.name(), verdict);
    }
    all_passed
}

fn main() {
    let tests: Vec<Box<dyn Runnable>> = vec![
        Box::new(Probe("adds", || calc::add(2, 3) == 5)),
        Box::new(Probe("subtracts", || calc::sub(2, 3) == -1)),
        Box::new(Probe("divides_by_zero", || calc::div(1, 0) == 0)),
    ];
    if !run_registered(&tests) {
        std::process::exit(1);
    }
}
