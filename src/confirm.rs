//! Operator confirmation for destructive or surprising steps.

use std::io::Write;

use colored::*;

/// Asks the operator a yes/no question.
pub trait Confirm: Send {
    fn confirm(&mut self, question: &str) -> bool;
}

/// Interactive `[y/N]` prompt on stdin. Anything but `y`/`yes` is a no.
pub struct Prompt;

impl Confirm for Prompt {
    fn confirm(&mut self, question: &str) -> bool {
        print!("{} {} ", question.yellow(), "[y/N]".dimmed());
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_err() {
            return false;
        }
        let answer = input.trim();
        answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
    }
}

/// Fixed answer, for `--force` and non-interactive callers.
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm(&mut self, _question: &str) -> bool {
        self.0
    }
}
