//! Playing games.
//!
//! [`ProcessGameRunner`] drives an external match program, one process per batch, called as
//!
//! ```text
//! <program> [program args] --games N --concurrency C --threads T
//!           --tc TC --new-tc TC --book FILE --book-depth D --tests-repo URL
//!           --new SHA --base SHA --new-options OPTS --base-options OPTS
//!           --pgn FILE [--new-param NAME=VALUE]... [--base-param NAME=VALUE]...
//! ```
//!
//! The program prints cutechess style lines on stdout:
//! `Score of <new> vs <base>: W - L - D ...` (cumulative, the last one wins),
//! one `... disconnects ...`/`... connection stalls ...` line per crash and one
//! `... loses on time ...` line per time loss. It writes the games to the `--pgn` file.
//! Exit status 0 is success, 2 means the run itself is broken, anything else is a local
//! failure.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info, instrument, warn};

use super::{
    error::WorkerError,
    process::{ManagedProcess, ProcessOutcome},
    state::SharedState,
};
use crate::{model::Stats, scheduler::TaskAssignment, stats::SpsaBatch};

/// Exit status of the match program for "stop this run".
pub const RUN_FAILURE_EXIT_CODE: i32 = 2;

/// One batch of games of the current task.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub assignment: &'a TaskAssignment,
    pub games: u32,
    pub concurrency: u32,
    /// Parameter values to play with, for SPSA runs.
    pub spsa: Option<&'a SpsaBatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub stats: Stats,
    pub pgn: String,
}

pub trait GameRunner {
    /// Called once per task before its first batch.
    fn prepare(&mut self, _assignment: &TaskAssignment) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Plays one batch. Must return promptly, with a fatal error, once `state` is stopped.
    fn play_batch(&mut self, batch: &Batch<'_>, state: &SharedState) -> Result<BatchOutcome, WorkerError>;
}

/// Reads the match program's stdout.
#[derive(Debug, Default)]
pub(crate) struct OutputParser {
    stats: Stats,
    score_seen: bool,
    last_line: String,
}

impl OutputParser {
    pub(crate) fn feed(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if let Some((wins, losses, draws)) = parse_score(line) {
            self.stats.wins = wins;
            self.stats.losses = losses;
            self.stats.draws = draws;
            self.score_seen = true;
        } else if line.contains("disconnects") || line.contains("connection stalls") {
            self.stats.crashes += 1;
        } else if line.contains("loses on time") {
            self.stats.time_losses += 1;
        }
        self.last_line = line.to_string();
    }

    pub(crate) fn stats(&self) -> Option<Stats> {
        self.score_seen.then_some(self.stats)
    }
}

fn parse_score(line: &str) -> Option<(u32, u32, u32)> {
    let rest = line.strip_prefix("Score of ")?;
    let (players, score) = rest.split_once(": ")?;
    if !players.contains(" vs ") {
        return None;
    }
    let tokens: Vec<&str> = score.split_whitespace().take(5).collect();
    match tokens.as_slice() {
        [w, "-", l, "-", d] => Some((w.parse().ok()?, l.parse().ok()?, d.parse().ok()?)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ProcessGameRunner {
    program: String,
    program_args: Vec<String>,
    work_dir: PathBuf,
    allow_stderr: bool,
}

impl ProcessGameRunner {
    pub fn new(program: &str, work_dir: &Path) -> Self {
        ProcessGameRunner {
            program: program.to_string(),
            program_args: Vec::new(),
            work_dir: work_dir.to_path_buf(),
            allow_stderr: true,
        }
    }

    /// Arguments placed before the batch arguments, e.g. a script for an interpreter.
    pub fn with_program_args(mut self, args: Vec<String>) -> Self {
        self.program_args = args;
        self
    }

    pub fn with_stderr(mut self, allow_stderr: bool) -> Self {
        self.allow_stderr = allow_stderr;
        self
    }

    fn pgn_path(&self, assignment: &TaskAssignment) -> PathBuf {
        self.work_dir
            .join(format!("{}-{}.pgn", assignment.run.id, assignment.task_id))
    }

    pub(crate) fn arguments(&self, batch: &Batch<'_>, pgn_path: &Path) -> Vec<String> {
        let args = &batch.assignment.run.args;
        let mut out = self.program_args.clone();
        let mut push = |flag: &str, value: String| {
            out.push(flag.to_string());
            out.push(value);
        };
        push("--games", batch.games.to_string());
        push("--concurrency", batch.concurrency.to_string());
        push("--threads", batch.assignment.threads.to_string());
        push("--tc", args.tc.clone());
        push("--new-tc", args.new_tc.clone());
        push("--book", args.book.clone());
        push("--book-depth", args.book_depth.to_string());
        push("--tests-repo", args.tests_repo.clone());
        push("--new", args.resolved_new.clone());
        push("--base", args.resolved_base.clone());
        push("--new-options", args.new_options.clone());
        push("--base-options", args.base_options.clone());
        push("--pgn", pgn_path.display().to_string());
        if let Some(spsa) = batch.spsa {
            for param in &spsa.w_params {
                push("--new-param", format!("{}={}", param.name, param.value));
            }
            for param in &spsa.b_params {
                push("--base-param", format!("{}={}", param.name, param.value));
            }
        }
        out
    }

    fn take_pgn(path: &Path) -> String {
        let pgn = match fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => return String::new(),
        };
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), "Could not delete PGN file: {e}");
        }
        pgn
    }
}

impl GameRunner for ProcessGameRunner {
    fn prepare(&mut self, assignment: &TaskAssignment) -> Result<(), WorkerError> {
        fs::create_dir_all(&self.work_dir).map_err(|e| {
            WorkerError::worker_failure(format!("could not create {}: {e}", self.work_dir.display()))
        })?;
        // leftovers of an interrupted earlier attempt
        let _ = fs::remove_file(self.pgn_path(assignment));
        Ok(())
    }

    #[instrument(skip_all, fields(run = %batch.assignment.run.id, task = batch.assignment.task_id, games = batch.games))]
    fn play_batch(&mut self, batch: &Batch<'_>, state: &SharedState) -> Result<BatchOutcome, WorkerError> {
        let pgn_path = self.pgn_path(batch.assignment);
        let args = self.arguments(batch, &pgn_path);
        let mut process = ManagedProcess::launch(&self.program, &args, &self.work_dir, self.allow_stderr)
            .map_err(|e| WorkerError::worker_failure(format!("{e:#}")))?;

        let mut parser = OutputParser::default();
        let outcome = process
            .watch(state, |line| {
                debug!("{line}");
                parser.feed(line);
            })
            .map_err(|e| WorkerError::worker_failure(format!("{e:#}")))?;
        let pgn = Self::take_pgn(&pgn_path);

        let status = match outcome {
            ProcessOutcome::Cancelled => return Err(WorkerError::fatal("Interrupted")),
            ProcessOutcome::Exited(status) => status,
        };
        if status.code() == Some(RUN_FAILURE_EXIT_CODE) {
            return Err(WorkerError::run_failure(format!(
                "The match program stopped the run: {}",
                parser.last_line
            )));
        }
        if !status.success() {
            return Err(WorkerError::worker_failure(format!(
                "The match program failed ({status}): {}",
                parser.last_line
            )));
        }
        let Some(stats) = parser.stats() else {
            return Err(WorkerError::worker_failure("The match program reported no score"));
        };
        if stats.games() > 0 && stats.crashes >= stats.games() {
            return Err(WorkerError::run_failure(format!(
                "Every game of the batch crashed ({} crashes)",
                stats.crashes
            )));
        }
        info!(%stats, crashes = stats.crashes, time_losses = stats.time_losses, "Batch finished");
        Ok(BatchOutcome { stats, pgn })
    }
}

#[cfg(test)]
mod runner_tests {
    use super::*;

    #[test]
    fn test_parser() {
        let mut parser = OutputParser::default();
        assert_eq!(parser.stats(), None);
        for line in [
            "Started game 1 of 4 (new vs base)",
            "Finished game 1 (new vs base): 0-1 {White loses on time}",
            "Score of new vs base: 0 - 1 - 0  [0.000] 1",
            "Finished game 2 (base vs new): 1-0 {Black disconnects}",
            "Score of new vs base: 0 - 2 - 0  [0.000] 2",
            "Score of new vs base: 1 - 2 - 1  [0.375] 4",
            "",
        ] {
            parser.feed(line);
        }
        let stats = parser.stats().unwrap();
        assert_eq!((stats.wins, stats.losses, stats.draws), (1, 2, 1));
        assert_eq!(stats.crashes, 1);
        assert_eq!(stats.time_losses, 1);
    }

    #[test]
    fn test_score_line_shapes() {
        assert_eq!(parse_score("Score of a vs b: 10 - 3 - 7"), Some((10, 3, 7)));
        assert_eq!(parse_score("Score of a vs b: 10 - 3"), None);
        assert_eq!(parse_score("Elo difference: 12.3 +/- 4.5"), None);
        assert_eq!(parse_score("Score of a: 1 - 2 - 3"), None);
    }
}
