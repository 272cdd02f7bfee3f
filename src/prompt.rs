//! User interaction boundary.
//!
//! All confirmations and selections go through the [`Prompt`] trait so the
//! orchestrator stays testable and `--auto` runs never block on a terminal.
//! Destructive confirmations default to "no": pressing enter declines.

use std::io::{BufRead, Write};

use anyhow::Result;

use crate::error::FlashwrightError;

/// Trait for user prompts.
pub trait Prompt {
    /// Asks a yes/no question. Returns false (decline) on empty input.
    fn confirm(&self, question: &str) -> Result<bool>;

    /// Asks the user to pick an index in `0..count`. `count` is at least 1.
    fn select(&self, question: &str, items: &[String]) -> Result<usize>;

    /// Reads a free-form line. Returns an empty string for "skip".
    fn line(&self, question: &str) -> Result<String>;
}

/// Console prompt reading from stdin.
pub struct ConsolePrompt;

impl ConsolePrompt {
    fn read_line(&self) -> Result<String> {
        let mut input = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut input)
            .map_err(|e| FlashwrightError::io("failed to read from stdin", e))?;
        Ok(input.trim().to_string())
    }
}

impl Prompt for ConsolePrompt {
    fn confirm(&self, question: &str) -> Result<bool> {
        loop {
            print!("{} [y/N]: ", question);
            std::io::stdout().flush().ok();
            let answer = self.read_line()?;
            match answer.as_str() {
                "y" | "Y" => return Ok(true),
                "" | "n" | "N" => return Ok(false),
                _ => eprintln!("please answer y or n"),
            }
        }
    }

    fn select(&self, question: &str, items: &[String]) -> Result<usize> {
        for (index, item) in items.iter().enumerate() {
            println!("  [{}]: {}", index, item);
        }
        loop {
            print!("{} [0-{}]: ", question, items.len() - 1);
            std::io::stdout().flush().ok();
            let answer = self.read_line()?;
            if let Ok(index) = answer.parse::<usize>()
                && index < items.len()
            {
                return Ok(index);
            }
            eprintln!("please enter a number between 0 and {}", items.len() - 1);
        }
    }

    fn line(&self, question: &str) -> Result<String> {
        print!("{}: ", question);
        std::io::stdout().flush().ok();
        self.read_line()
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! Scripted prompt used by unit tests across the crate.

    use std::sync::Mutex;

    use anyhow::Result;

    use super::Prompt;

    /// Replays a fixed script of answers; panics if the script runs dry.
    pub struct ScriptedPrompt {
        answers: Mutex<Vec<String>>,
    }

    impl ScriptedPrompt {
        pub fn new<I, S>(answers: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            }
        }

        fn next(&self) -> String {
            let mut answers = self.answers.lock().unwrap();
            assert!(!answers.is_empty(), "scripted prompt ran out of answers");
            answers.remove(0)
        }
    }

    impl Prompt for ScriptedPrompt {
        fn confirm(&self, _question: &str) -> Result<bool> {
            Ok(matches!(self.next().as_str(), "y" | "Y"))
        }

        fn select(&self, _question: &str, items: &[String]) -> Result<usize> {
            let index: usize = self.next().parse().expect("scripted selection must be numeric");
            assert!(index < items.len(), "scripted selection out of range");
            Ok(index)
        }

        fn line(&self, _question: &str) -> Result<String> {
            Ok(self.next())
        }
    }
}
