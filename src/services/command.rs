use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::services::handlers::{HandlerError, JobContext, JobHandler};

/// Runs an external program for each job.
///
/// The job payload is written to the program's stdin as JSON and `JOB_ID`,
/// `JOB_TYPE` and `JOB_ATTEMPT` are set in its environment. Exit status 0 is a
/// success carrying stdout; any other exit status fails the job permanently
/// with stderr as the error. Failing to start the program is retryable.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandHandler {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    /// Build from a whitespace-separated command line such as
    /// `python generate_amazon_content.py --upload-images`.
    ///
    /// Single or double quotes keep a word with spaces together
    /// (`"/opt/my scripts/run.py"`). There are no escapes. `None` when the line
    /// is empty or a quote is left open.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut words = split_words(line)?.into_iter();
        let program = words.next()?;
        Some(Self::new(program, words))
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        if let Err(e) = ctx.report_progress(json!({ "stage": "starting" })).await {
            tracing::warn!(job_id = %ctx.job_id, error = %e, "Failed to report progress");
        }

        let input = serde_json::to_vec(&ctx.payload)?;
        let start = Instant::now();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("JOB_ID", ctx.job_id.to_string())
            .env("JOB_TYPE", &ctx.job_type)
            .env("JOB_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        tracing::debug!(job_id = %ctx.job_id, program = %self.program, "Spawning job command");
        let mut child = command.spawn()?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe.
        let feeder = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                match stdin.write_all(&input).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                }
            })
        });

        let output = child.wait_with_output().await?;
        if let Some(feeder) = feeder {
            if let Ok(Err(e)) = feeder.await {
                tracing::warn!(job_id = %ctx.job_id, error = %e, "Failed to write payload to job command");
            }
        }

        let duration = start.elapsed().as_secs_f64();
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if output.status.success() {
            tracing::info!(
                job_id = %ctx.job_id,
                duration_seconds = duration,
                "Job command finished"
            );
            Ok(json!({ "output": stdout, "duration_seconds": duration }))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let error = if stderr.is_empty() {
                format!("Script failed ({})", output.status)
            } else {
                stderr
            };
            Err(HandlerError::Permanent(error))
        }
    }
}

fn split_words(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => word.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            None => {
                word.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return None;
    }
    if in_word {
        words.push(word);
    }
    Some(words)
}
