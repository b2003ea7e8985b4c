//! Validation of new runs and of run modifications.

use serde::{Deserialize, Serialize};

use super::selection::estimate_game_duration;
use crate::{
    error::SchedulerError,
    model::{RunArgs, StopRule, MAX_GAMES},
    stats::{
        spsa::{Clipping, Rounding},
        EloModel, SpsaRun, SprtState,
    },
};

/// Games cap of an SPRT run.
pub const SPRT_MAX_GAMES: u32 = 800_000;
/// Game pairs between two SPRT evaluations.
pub const SPRT_BATCH_PAIRS: u32 = 4;

fn default_book_depth() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

fn default_elo_model() -> String {
    EloModel::default().to_string()
}

fn default_error_rate() -> f64 {
    0.05
}

/// Stopping rule as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum StopRuleRequest {
    FixedGames {
        num_games: u32,
    },
    Sprt {
        elo0: f64,
        elo1: f64,
        #[serde(default = "default_elo_model")]
        elo_model: String,
        #[serde(default = "default_error_rate")]
        alpha: f64,
        #[serde(default = "default_error_rate")]
        beta: f64,
    },
    Spsa {
        num_games: u32,
        #[serde(rename = "A")]
        a_offset: f64,
        alpha: f64,
        gamma: f64,
        raw_params: String,
        #[serde(default)]
        clipping: String,
        #[serde(default)]
        rounding: String,
    },
}

/// A run submission, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub base_tag: String,
    pub new_tag: String,
    pub resolved_base: String,
    pub resolved_new: String,
    pub base_signature: String,
    pub new_signature: String,
    #[serde(default)]
    pub base_options: String,
    #[serde(default)]
    pub new_options: String,
    pub tc: String,
    #[serde(default)]
    pub new_tc: Option<String>,
    #[serde(default)]
    pub book: String,
    #[serde(default = "default_book_depth")]
    pub book_depth: u32,
    pub threads: u32,
    #[serde(default)]
    pub priority: i32,
    pub throughput: u32,
    pub tests_repo: String,
    pub info: String,
    #[serde(default = "default_true")]
    pub auto_purge: bool,
    #[serde(default = "default_true")]
    pub adjudication: bool,
    pub stop_rule: StopRuleRequest,
}

/// Fields of a run its owner (or an approver) may change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunModification {
    pub num_games: u32,
    pub priority: i32,
    pub throughput: u32,
    pub auto_purge: bool,
}

fn invalid(message: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidRun(message.into())
}

fn is_decimal(s: &str) -> bool {
    let (integer, fraction) = match s.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (s, None),
    };
    let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    digits(integer) && fraction.map_or(true, digits)
}

/// `[moves/]base[+increment]`, with moves a positive integer without leading zero.
pub fn is_valid_time_control(tc: &str) -> bool {
    let clock = match tc.split_once('/') {
        Some((moves, clock)) => {
            let valid_moves = !moves.is_empty()
                && !moves.starts_with('0')
                && moves.bytes().all(|b| b.is_ascii_digit());
            if !valid_moves {
                return false;
            }
            clock
        }
        None => tc,
    };
    match clock.split_once('+') {
        Some((base, increment)) => is_decimal(base) && is_decimal(increment),
        None => is_decimal(clock),
    }
}

/// Whether base + increment of a well-formed time control is positive.
fn has_clock(tc: &str) -> bool {
    estimate_game_duration(tc).is_some_and(|seconds| seconds > 0.0)
}

fn check_num_games(num_games: u32) -> Result<(), SchedulerError> {
    if num_games == 0 {
        return Err(invalid("Number of games must be > 0"));
    }
    if num_games > MAX_GAMES {
        return Err(invalid(format!("Number of games must be <= {MAX_GAMES}")));
    }
    Ok(())
}

fn build_stop_rule(request: StopRuleRequest) -> Result<(u32, StopRule), SchedulerError> {
    match request {
        StopRuleRequest::FixedGames { num_games } => {
            check_num_games(num_games)?;
            if num_games % 2 != 0 {
                return Err(invalid("Number of games must be even"));
            }
            Ok((num_games, StopRule::FixedGames))
        }
        StopRuleRequest::Sprt {
            elo0,
            elo1,
            elo_model,
            alpha,
            beta,
        } => {
            let elo_model: EloModel = elo_model.parse().map_err(|e| invalid(format!("{e}")))?;
            if !(elo0 < elo1) {
                return Err(invalid("elo0 must be lower than elo1"));
            }
            if !(0.0 < alpha && alpha < 0.5 && 0.0 < beta && beta < 0.5) {
                return Err(invalid("alpha and beta must be in (0, 0.5)"));
            }
            let sprt = SprtState::new(elo0, elo1, alpha, beta, elo_model, SPRT_BATCH_PAIRS);
            Ok((SPRT_MAX_GAMES, StopRule::Sprt(sprt)))
        }
        StopRuleRequest::Spsa {
            num_games,
            a_offset,
            alpha,
            gamma,
            raw_params,
            clipping,
            rounding,
        } => {
            check_num_games(num_games)?;
            if num_games % 2 != 0 {
                return Err(invalid("Number of games must be even"));
            }
            if !(a_offset.is_finite() && a_offset >= 0.0) {
                return Err(invalid("SPSA A must be >= 0"));
            }
            if !(alpha.is_finite() && alpha > 0.0) {
                return Err(invalid("SPSA alpha must be > 0"));
            }
            if !(gamma.is_finite() && gamma > 0.0) {
                return Err(invalid("SPSA gamma must be > 0"));
            }
            let clipping = match clipping.as_str() {
                "" => Clipping::default(),
                other => other.parse().map_err(|e| invalid(format!("{e}")))?,
            };
            let rounding = match rounding.as_str() {
                "" => Rounding::default(),
                other => other.parse().map_err(|e| invalid(format!("{e}")))?,
            };
            let num_iter = u64::from(num_games / 2);
            let spsa = SpsaRun::new(a_offset, alpha, gamma, num_iter, clipping, rounding, &raw_params)
                .map_err(|e| invalid(format!("{e:#}")))?;
            Ok((num_games, StopRule::Spsa(spsa)))
        }
    }
}

/// Check a submission and turn it into the arguments of a new run owned by `username`.
pub fn validate(request: RunRequest, username: &str) -> Result<RunArgs, SchedulerError> {
    let new_tc = request.new_tc.clone().unwrap_or_else(|| request.tc.clone());
    if !is_valid_time_control(&request.tc) {
        return Err(invalid("Bad time control format (base TC)"));
    }
    if !is_valid_time_control(&new_tc) {
        return Err(invalid("Bad time control format (new TC)"));
    }
    if !has_clock(&request.tc) || !has_clock(&new_tc) {
        return Err(invalid("Time control must leave some time on the clock"));
    }
    let required = [
        ("base_tag", &request.base_tag),
        ("new_tag", &request.new_tag),
        ("resolved_base", &request.resolved_base),
        ("resolved_new", &request.resolved_new),
        ("new_signature", &request.new_signature),
        ("tests_repo", &request.tests_repo),
        ("info", &request.info),
    ];
    if let Some((name, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(invalid(format!("Missing required option: {name}")));
    }
    if request.threads == 0 {
        return Err(invalid("Threads must be >= 1"));
    }
    if request.throughput == 0 {
        return Err(invalid("Throughput must be >= 1"));
    }

    let (num_games, stop_rule) = build_stop_rule(request.stop_rule)?;
    // both sides of an SPSA run are the same binary
    let base_signature = match stop_rule {
        StopRule::Spsa(_) => request.new_signature.clone(),
        _ => request.base_signature,
    };
    if base_signature.trim().is_empty() {
        return Err(invalid("Missing required option: base_signature"));
    }

    Ok(RunArgs {
        base_tag: request.base_tag,
        new_tag: request.new_tag,
        resolved_base: request.resolved_base,
        resolved_new: request.resolved_new,
        base_signature,
        new_signature: request.new_signature,
        base_options: request.base_options,
        new_options: request.new_options,
        tc: request.tc,
        new_tc,
        book: request.book,
        book_depth: request.book_depth,
        threads: request.threads,
        priority: request.priority,
        throughput: request.throughput,
        num_games,
        username: username.to_string(),
        tests_repo: request.tests_repo,
        info: request.info,
        auto_purge: request.auto_purge,
        adjudication: request.adjudication,
        stop_rule,
    })
}

#[cfg(test)]
mod submission_tests {
    use super::*;

    pub(crate) fn request(stop_rule: StopRuleRequest) -> RunRequest {
        RunRequest {
            base_tag: "master".into(),
            new_tag: "patch".into(),
            resolved_base: "aaaa".into(),
            resolved_new: "bbbb".into(),
            base_signature: "111".into(),
            new_signature: "222".into(),
            base_options: "Hash=16".into(),
            new_options: "Hash=16".into(),
            tc: "10+0.1".into(),
            new_tc: None,
            book: "book.epd".into(),
            book_depth: 8,
            threads: 1,
            priority: 0,
            throughput: 100,
            tests_repo: "https://example.org/repo".into(),
            info: "speedup".into(),
            auto_purge: true,
            adjudication: true,
            stop_rule,
        }
    }

    #[test]
    fn test_time_controls() {
        for tc in ["10+0.1", "60", "40/60", "1.5+0.01", "60+1"] {
            assert!(is_valid_time_control(tc), "{tc}");
        }
        for tc in ["", "0/60", "10+", "+0.1", "1:30", "10+0.1+1", "abc", "10."] {
            assert!(!is_valid_time_control(tc), "{tc}");
        }
    }

    #[test]
    fn test_sprt_defaults() {
        let args = validate(
            request(StopRuleRequest::Sprt {
                elo0: 0.0,
                elo1: 5.0,
                elo_model: "normalized".into(),
                alpha: 0.05,
                beta: 0.05,
            }),
            "alice",
        )
        .unwrap();
        assert_eq!(args.num_games, SPRT_MAX_GAMES);
        assert_eq!(args.new_tc, "10+0.1");
        assert_eq!(args.username, "alice");
        let sprt = args.stop_rule.sprt().unwrap();
        assert_eq!(sprt.batch_size, 4);
        assert_eq!(sprt.elo_model, EloModel::Normalized);
    }

    #[test]
    fn test_spsa_uses_new_signature_for_base() {
        let args = validate(
            request(StopRuleRequest::Spsa {
                num_games: 200,
                a_offset: 5000.0,
                alpha: 0.602,
                gamma: 0.101,
                raw_params: "Tempo,100,0,200,10,0.002".into(),
                clipping: "careful".into(),
                rounding: String::new(),
            }),
            "alice",
        )
        .unwrap();
        assert_eq!(args.base_signature, "222");
        let spsa = args.stop_rule.spsa().unwrap();
        assert_eq!(spsa.num_iter, 100);
        assert_eq!(spsa.clipping, Clipping::Careful);
        assert_eq!(spsa.rounding, Rounding::Deterministic);
    }

    #[test]
    fn test_rejections() {
        let reject = |request: RunRequest| validate(request, "alice").unwrap_err().to_string();

        assert!(reject(request(StopRuleRequest::FixedGames { num_games: 0 })).contains("must be > 0"));
        assert!(reject(request(StopRuleRequest::FixedGames { num_games: 3 })).contains("even"));
        assert!(reject(request(StopRuleRequest::FixedGames { num_games: MAX_GAMES + 2 })).contains("<="));
        assert!(reject(request(StopRuleRequest::Sprt {
            elo0: 5.0,
            elo1: 0.0,
            elo_model: "logistic".into(),
            alpha: 0.05,
            beta: 0.05
        }))
        .contains("elo0"));
        assert!(reject(request(StopRuleRequest::Sprt {
            elo0: 0.0,
            elo1: 5.0,
            elo_model: "elo".into(),
            alpha: 0.05,
            beta: 0.05
        }))
        .contains("Unknown Elo model"));

        let mut bad_tc = request(StopRuleRequest::FixedGames { num_games: 100 });
        bad_tc.new_tc = Some("fast".into());
        assert!(reject(bad_tc).contains("new TC"));

        let mut missing = request(StopRuleRequest::FixedGames { num_games: 100 });
        missing.info = " ".into();
        assert!(reject(missing).contains("Missing required option: info"));

        let mut threads = request(StopRuleRequest::FixedGames { num_games: 100 });
        threads.threads = 0;
        assert!(reject(threads).contains("Threads"));

        for tc in ["0", "0+0", "40/0.0+0"] {
            let mut no_clock = request(StopRuleRequest::FixedGames { num_games: 100 });
            no_clock.tc = tc.into();
            assert!(reject(no_clock).contains("time on the clock"), "{tc}");
        }
        let mut no_new_clock = request(StopRuleRequest::FixedGames { num_games: 100 });
        no_new_clock.new_tc = Some("0".into());
        assert!(reject(no_new_clock).contains("time on the clock"));

        let spsa = |num_games: u32, a_offset: f64, alpha: f64, gamma: f64| {
            request(StopRuleRequest::Spsa {
                num_games,
                a_offset,
                alpha,
                gamma,
                raw_params: "Tempo,100,0,200,10,0.002".into(),
                clipping: String::new(),
                rounding: String::new(),
            })
        };
        assert!(reject(spsa(1, 5.0, 0.602, 0.101)).contains("even"));
        assert!(reject(spsa(3, 5.0, 0.602, 0.101)).contains("even"));
        assert!(reject(spsa(0, 5.0, 0.602, 0.101)).contains("must be > 0"));
        assert!(reject(spsa(100, -1.0, 0.602, 0.101)).contains("SPSA A"));
        assert!(reject(spsa(100, f64::NAN, 0.602, 0.101)).contains("SPSA A"));
        assert!(reject(spsa(100, 5.0, 0.0, 0.101)).contains("SPSA alpha"));
        assert!(reject(spsa(100, 5.0, f64::INFINITY, 0.101)).contains("SPSA alpha"));
        assert!(reject(spsa(100, 5.0, 0.602, -0.1)).contains("SPSA gamma"));
        assert!(reject(spsa(100, 5.0, 0.602, f64::NAN)).contains("SPSA gamma"));
        let smallest = validate(spsa(2, 0.0, 0.602, 0.101), "alice").unwrap();
        assert_eq!(smallest.stop_rule.spsa().unwrap().num_iter, 1);
    }
}
