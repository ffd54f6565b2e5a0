use std::fmt;
use std::io::{BufRead, BufReader};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use thiserror::Error;

use crate::output::Console;

/// Errors from executing work items.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("failed waiting on '{command}': {source}")]
    Wait {
        command: String,
        source: std::io::Error,
    },
    #[error("command failed ({status}): {command}")]
    CommandFailed { command: String, status: ExitStatus },
    #[error("giving up after {attempts} attempts: {source}")]
    RetryExhausted { attempts: u32, source: Box<WorkError> },
    #[error("work graph has a cycle among {remaining} items")]
    Cycle { remaining: usize },
}

/// Exponential backoff between retry attempts:
/// `multiplier * attempt^exponent + constant` seconds.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Backoff {
    pub multiplier: u64,
    pub exponent: u32,
    pub constant: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            multiplier: 15,
            exponent: 2,
            constant: 5,
        }
    }
}

impl Backoff {
    /// Delay before retrying after the given (0-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.multiplier * u64::from(attempt).pow(self.exponent) + self.constant)
    }
}

/// An executable leaf of the build plan.
///
/// Identity (for graph edges and display) is the item's string form: the
/// shell-quoted command line, prefixed when wrapped in a retry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Work {
    /// Run an argv, merging its stderr into its stdout.
    Command {
        argv: Vec<String>,
        working_directory: Option<Utf8PathBuf>,
    },
    /// Run the inner work, retrying failed commands with backoff.
    Retry {
        work: Box<Work>,
        attempts: u32,
        backoff: Backoff,
    },
}

/// The default number of attempts for retried work.
pub const DEFAULT_ATTEMPTS: u32 = 5;

impl Work {
    /// Wrap work in a retry with the default attempt count and backoff.
    pub fn retry(work: Work) -> Work {
        Work::Retry {
            work: Box::new(work),
            attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }

    /// Execute the work item, streaming its output through the console.
    pub fn run(&self, console: &Arc<Console>) -> Result<(), WorkError> {
        match self {
            Work::Command {
                argv,
                working_directory,
            } => run_command(argv, working_directory.as_deref(), console),
            Work::Retry {
                work,
                attempts,
                backoff,
            } => run_retry(work, *attempts, backoff, console),
        }
    }
}

fn join_argv(argv: &[String]) -> String {
    match shlex::try_join(argv.iter().map(String::as_str)) {
        Ok(joined) => joined,
        Err(_) => argv.join(" "),
    }
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Command { argv, .. } => f.write_str(&join_argv(argv)),
            Work::Retry { work, attempts, .. } => {
                write!(f, "Retry(attempts={attempts}): {work}")
            }
        }
    }
}

fn run_retry(
    work: &Work,
    attempts: u32,
    backoff: &Backoff,
    console: &Arc<Console>,
) -> Result<(), WorkError> {
    let mut attempt = 0;
    loop {
        match work.run(console) {
            Ok(()) => return Ok(()),
            // Only command failures are transient; everything else
            // propagates immediately
            Err(error @ WorkError::CommandFailed { .. }) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(WorkError::RetryExhausted {
                        attempts,
                        source: Box::new(error),
                    });
                }
                let delay = backoff.delay(attempt - 1);
                tracing::warn!(
                    error = %error,
                    delay_secs = delay.as_secs(),
                    "retrying after failure"
                );
                std::thread::sleep(delay);
            }
            Err(error) => return Err(error),
        }
    }
}

fn run_command(
    argv: &[String],
    working_directory: Option<&Utf8Path>,
    console: &Arc<Console>,
) -> Result<(), WorkError> {
    let display = join_argv(argv);
    let (program, args) = argv.split_first().ok_or_else(|| WorkError::Spawn {
        command: display.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
    })?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(directory) = working_directory {
        command.current_dir(directory);
    }
    let mut child = command.spawn().map_err(|source| WorkError::Spawn {
        command: display.clone(),
        source,
    })?;

    let writer = console.open(display.as_str());
    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    std::thread::scope(|scope| {
        let stderr_writer = &writer;
        scope.spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => stderr_writer.write_line(&line),
                    Err(_) => break,
                }
            }
        });
        for line in BufReader::new(stdout).lines() {
            match line {
                Ok(line) => writer.write_line(&line),
                Err(_) => break,
            }
        }
    });

    let status = child.wait();
    writer.close();
    let status = status.map_err(|source| WorkError::Wait {
        command: display.clone(),
        source,
    })?;
    if !status.success() {
        return Err(WorkError::CommandFailed {
            command: display,
            status,
        });
    }
    Ok(())
}

/// Maps each work item to the items that must complete before it starts.
pub type WorkGraph = IndexMap<Work, Vec<Work>>;

/// How to run a work graph.
#[derive(Debug, Default)]
pub struct ExecuteOptions {
    /// Worker threads; defaults to the host's available parallelism.
    pub max_workers: Option<usize>,
    /// Print each item's string form instead of running it.
    pub dry_run: bool,
}

/// Run every item in the graph on a bounded worker pool, prerequisites
/// strictly first.
///
/// On the first failure no further items are started: queued items are
/// dropped, in-flight items run to completion (their output still flushes
/// through the console), and the first error is returned.
pub fn execute(
    work_graph: &WorkGraph,
    console: &Arc<Console>,
    options: &ExecuteOptions,
) -> Result<(), WorkError> {
    let workers = options
        .max_workers
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(4, |workers| workers.get()))
        .max(1);
    tracing::debug!(workers, items = work_graph.len(), "executing work graph");

    let mut pending = work_graph.clone();
    let (ready_tx, ready_rx) = mpsc::channel::<Work>();
    let ready_rx = Mutex::new(ready_rx);
    let (done_tx, done_rx) = mpsc::channel::<(Work, Result<(), WorkError>)>();
    let cancelled = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let done_tx = done_tx.clone();
            let ready_rx = &ready_rx;
            let cancelled = &cancelled;
            scope.spawn(move || {
                loop {
                    let work = {
                        let receiver = ready_rx.lock().expect("ready queue lock");
                        match receiver.recv() {
                            Ok(work) => work,
                            Err(_) => break,
                        }
                    };
                    // Skip items queued before a failure elsewhere
                    let result = if cancelled.load(Ordering::SeqCst) {
                        Ok(())
                    } else if options.dry_run {
                        console.print_line(&work.to_string());
                        Ok(())
                    } else {
                        work.run(console)
                    };
                    if done_tx.send((work, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);

        // The coordinator owns the graph: submit ready items, then drain
        // completions, releasing whatever each one unblocks.
        let mut in_flight = submit_ready(&mut pending, &ready_tx);
        let mut failure: Option<WorkError> = None;
        while in_flight > 0 {
            let Ok((done, result)) = done_rx.recv() else {
                break;
            };
            in_flight -= 1;
            match result {
                Ok(()) if failure.is_none() => {
                    for prerequisites in pending.values_mut() {
                        prerequisites.retain(|prerequisite| prerequisite != &done);
                    }
                    in_flight += submit_ready(&mut pending, &ready_tx);
                }
                Ok(()) => {}
                Err(error) => {
                    cancelled.store(true, Ordering::SeqCst);
                    if failure.is_none() {
                        tracing::error!(error = %error, "work failed; cancelling remaining work");
                        failure = Some(error);
                    }
                }
            }
        }
        drop(ready_tx);

        if let Some(error) = failure {
            return Err(error);
        }
        if !pending.is_empty() {
            return Err(WorkError::Cycle {
                remaining: pending.len(),
            });
        }
        Ok(())
    })
}

/// Move every item with no outstanding prerequisites onto the ready
/// queue; returns how many were submitted.
fn submit_ready(pending: &mut WorkGraph, ready_tx: &mpsc::Sender<Work>) -> usize {
    let ready: Vec<Work> = pending
        .iter()
        .filter(|(_, prerequisites)| prerequisites.is_empty())
        .map(|(work, _)| work.clone())
        .collect();
    let mut submitted = 0;
    for work in ready {
        pending.shift_remove(&work);
        if ready_tx.send(work).is_ok() {
            submitted += 1;
        }
    }
    submitted
}

/// Render the graph in DOT format for debugging.
pub fn graph_to_dot(work_graph: &WorkGraph) -> String {
    fn label(work: &Work) -> String {
        work.to_string().replace('"', "\\\"")
    }

    let mut output = vec!["digraph work_graph {".to_string()];
    for work in work_graph.keys() {
        output.push(format!("  \"{}\";", label(work)));
    }
    for (work, prerequisites) in work_graph {
        for prerequisite in prerequisites {
            output.push(format!(
                "  \"{}\" -> \"{}\";",
                label(work),
                label(prerequisite)
            ));
        }
    }
    output.push("}".to_string());
    output.join("\n")
}
