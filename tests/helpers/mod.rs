use std::sync::Mutex;

use anyhow::Result;
use camino::Utf8PathBuf;
use flashwright::executor::{CapturedOutput, CommandExecutor, CommandSpec, ExecutionResult};
use flashwright::prompt::Prompt;

/// Executor that records every call and succeeds, handing out canned UUIDs
/// for `blkid` captures.
pub struct RecordingExecutor {
    pub calls: Mutex<Vec<Vec<String>>>,
    /// Command names that should return a non-zero exit status.
    pub failing_commands: Vec<String>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing_commands: vec![],
        }
    }

    #[allow(dead_code)]
    pub fn failing_on(command: &str) -> Self {
        Self {
            failing_commands: vec![command.to_string()],
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// The recorded command names, in call order.
    pub fn command_names(&self) -> Vec<String> {
        self.calls().iter().map(|call| call[0].clone()).collect()
    }

    fn record(&self, spec: &CommandSpec) -> usize {
        let mut calls = self.calls.lock().unwrap();
        let mut line = vec![spec.command.clone()];
        line.extend(spec.args.iter().cloned());
        calls.push(line);
        calls.len() - 1
    }

    fn status_for(&self, spec: &CommandSpec) -> Option<std::process::ExitStatus> {
        use std::os::unix::process::ExitStatusExt;
        let raw = if self.failing_commands.contains(&spec.command) { 1 << 8 } else { 0 };
        Some(std::process::ExitStatus::from_raw(raw))
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        self.record(spec);
        Ok(ExecutionResult {
            status: self.status_for(spec),
        })
    }

    fn capture(&self, spec: &CommandSpec) -> Result<CapturedOutput> {
        let index = self.record(spec);
        let stdout = if spec.command == "blkid" {
            format!("0000-{:04}\n", index)
        } else if spec.command == "openssl" {
            "$6$testsalt$testhash\n".to_string()
        } else {
            String::new()
        };
        Ok(CapturedOutput {
            status: self.status_for(spec),
            stdout,
        })
    }
}

/// Replays a fixed script of prompt answers.
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

/// Builds a ustar archive at `path` from (member name, content) pairs.
pub fn build_tar(path: &Utf8PathBuf, members: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path.as_std_path()).unwrap();
    let mut builder = tar::Builder::new(file);
    for (name, content) in members {
        let mut header = tar::Header::new_ustar();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.finish().unwrap();
}
