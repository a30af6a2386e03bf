//! Controlled nondeterminism.
//!
//! Every nondeterministic decision of a run goes through a [`ChoicePath`]:
//! which event fires next, whether a delivery is followed by a socket error,
//! and every `rand_int` a service makes. The path records each choice as
//! `(out_of, value)`, which is all that is needed to replay it.
//!
//! Three strategies fill in the values:
//!
//! - **Random**: a seeded [`ChaCha8Rng`].
//! - **Search**: iterative deepening. The first `depth` choices of a path
//!   enumerate the choice tree in order; later choices are random. When the
//!   tree up to `depth` is exhausted the depth grows by `SEARCH_DEPTH`.
//! - **Replay**: values come from a recorded choice file.

use crate::{ChoiceStrategy, SimulationError, SimulationParams};
use im::Vector;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Choice points with more options than this are sampled, not enumerated.
pub const MAX_RAND_INT: u64 = 1000;

/// One recorded choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Choice {
    /// Number of options.
    pub out_of: u64,
    /// Option taken.
    pub value: u64,
}

/// Iterative-deepening enumeration state, persistent across paths.
#[derive(Debug, Clone)]
struct DepthSearch {
    depth: usize,
    increment: usize,
    max_depth: usize,
    samples: u64,
    selections: Vector<u64>,
    out_of: Vector<u64>,
    repeats: Vector<u64>,
    /// True while every path at this depth has ended before reaching it.
    done_early: bool,
}

impl DepthSearch {
    fn new(increment: usize, max_depth: usize, samples: u64) -> Self {
        Self {
            depth: increment,
            increment,
            max_depth,
            samples,
            selections: Vector::unit(0),
            out_of: Vector::new(),
            repeats: Vector::unit(0),
            done_early: true,
        }
    }

    /// Value for the search choice at `offset`, or `None` past the depth.
    fn select(
        &mut self,
        offset: usize,
        out_of: u64,
        rng: &mut ChaCha8Rng,
    ) -> Result<Option<u64>, SimulationError> {
        if offset >= self.depth {
            self.done_early = false;
            return Ok(None);
        }
        if offset >= self.out_of.len() {
            self.out_of.push_back(out_of);
            if offset >= self.selections.len() {
                let first = if out_of > MAX_RAND_INT {
                    rng.gen_range(0..out_of)
                } else {
                    0
                };
                self.selections.push_back(first);
                self.repeats.push_back(0);
            }
        }
        if self.out_of[offset] != out_of {
            return Err(SimulationError::Nondeterminism {
                position: offset,
                expected: self.out_of[offset],
                actual: out_of,
            });
        }
        if offset + 1 == self.depth {
            self.done_early = false;
        }
        Ok(Some(self.selections[offset]))
    }

    fn has_next(&self, path_len: usize) -> bool {
        let frontier = self.depth.min(path_len).min(self.out_of.len());
        for i in 0..frontier {
            if self.out_of[i] > MAX_RAND_INT {
                if self.repeats[i] < self.samples {
                    return true;
                }
            } else if self.selections[i] + 1 < self.out_of[i] {
                return true;
            }
        }
        !self.done_early && self.depth < self.max_depth
    }

    /// Step to the next sequence. Returns true when the depth grew.
    fn advance(&mut self, path_len: usize, rng: &mut ChaCha8Rng) -> bool {
        if self.out_of.is_empty() {
            return false;
        }
        let mut new_depth = self.depth.min(path_len).min(self.out_of.len());
        while new_depth > 0 {
            let i = new_depth - 1;
            if self.out_of[i] > MAX_RAND_INT {
                self.selections[i] = rng.gen_range(0..self.out_of[i]);
                self.repeats[i] += 1;
                if self.repeats[i] < self.samples {
                    break;
                }
            } else {
                self.selections[i] += 1;
                if self.selections[i] < self.out_of[i] {
                    break;
                }
            }
            new_depth -= 1;
        }
        self.selections.truncate(new_depth);
        self.out_of.truncate(new_depth);
        self.repeats.truncate(new_depth);
        if new_depth == 0 {
            self.done_early = true;
            self.depth += self.increment;
            return true;
        }
        false
    }
}

/// Source and record of every nondeterministic choice on the current path.
#[derive(Debug, Clone)]
pub struct ChoicePath {
    strategy: ChoiceStrategy,
    weighted: bool,
    seed: u64,
    rng: ChaCha8Rng,
    /// Independent stream for timing noise; restarted every path.
    timing_rng: ChaCha8Rng,
    prefix: Vector<Choice>,
    position: usize,
    search_choices: Vector<Choice>,
    random_choices: Vector<Choice>,
    search: Option<DepthSearch>,
    phase: String,
}

impl ChoicePath {
    /// Pure random walk from `seed`.
    pub fn random(seed: u64) -> Self {
        Self {
            strategy: ChoiceStrategy::Random,
            weighted: false,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            timing_rng: ChaCha8Rng::seed_from_u64(seed),
            prefix: Vector::new(),
            position: 0,
            search_choices: Vector::new(),
            random_choices: Vector::new(),
            search: None,
            phase: "random".to_string(),
        }
    }

    /// Iterative-deepening search.
    pub fn search(seed: u64, increment: usize, max_depth: usize, samples: u64) -> Self {
        let search = DepthSearch::new(increment, max_depth, samples);
        Self {
            strategy: ChoiceStrategy::Search,
            phase: format!("depth {}", search.depth),
            search: Some(search),
            ..Self::random(seed)
        }
    }

    /// Replay of recorded choices, random past their end.
    pub fn replay(seed: u64, choices: Vec<Choice>) -> Self {
        Self {
            strategy: ChoiceStrategy::Replay,
            prefix: choices.into_iter().collect(),
            phase: "replay".to_string(),
            ..Self::random(seed)
        }
    }

    /// Build the path the parameters ask for, reading the replay file if any.
    pub fn from_params(params: &SimulationParams) -> Result<Self, SimulationError> {
        let mut path = match params.choice_strategy {
            ChoiceStrategy::Random => Self::random(params.seed),
            ChoiceStrategy::Search => Self::search(
                params.seed,
                params.search_depth,
                params.max_search_depth,
                params.num_random_samples,
            ),
            ChoiceStrategy::Replay => {
                let file = params.replay_file.as_deref().ok_or_else(|| {
                    SimulationError::InvalidParams("replay requires REPLAY_FILE".into())
                })?;
                Self::replay(params.seed, read_choice_file(file)?)
            }
        };
        path.weighted = params.use_gusto;
        Ok(path)
    }

    /// Use weighted ("gusto") selection for [`weighted`](Self::weighted).
    pub fn with_weighted(mut self, weighted: bool) -> Self {
        self.weighted = weighted;
        self
    }

    pub fn strategy(&self) -> ChoiceStrategy {
        self.strategy
    }

    pub fn is_weighted(&self) -> bool {
        self.weighted
    }

    /// A choice in `[0, out_of)`. `out_of <= 1` returns 0 without recording.
    pub fn uniform(&mut self, out_of: u64) -> Result<u64, SimulationError> {
        if out_of <= 1 {
            return Ok(0);
        }
        let value = if self.position < self.prefix.len() {
            let recorded = self.prefix[self.position];
            if recorded.out_of != out_of || recorded.value >= out_of {
                return Err(SimulationError::Nondeterminism {
                    position: self.position,
                    expected: recorded.out_of,
                    actual: out_of,
                });
            }
            recorded.value
        } else {
            let offset = self.search_choices.len();
            let searched = match self.search.as_mut() {
                Some(search) => search.select(offset, out_of, &mut self.rng)?,
                None => None,
            };
            match searched {
                Some(value) => {
                    self.search_choices.push_back(Choice { out_of, value });
                    value
                }
                None => {
                    let value = self.rng.gen_range(0..out_of);
                    self.random_choices.push_back(Choice { out_of, value });
                    value
                }
            }
        };
        self.position += 1;
        Ok(value)
    }

    /// Pick an index of `weights`.
    ///
    /// Weighted mode draws in `[0, sum)` and walks the weight bands, so
    /// zero-weight entries are never picked. Otherwise every index is equally
    /// likely, zero weights included, so a search visits all of them.
    pub fn weighted(&mut self, weights: &[u64]) -> Result<usize, SimulationError> {
        if weights.is_empty() {
            return Err(SimulationError::InvariantViolation(
                "weighted choice over no options".into(),
            ));
        }
        if !self.weighted {
            return Ok(self.uniform(weights.len() as u64)? as usize);
        }
        let total: u64 = weights.iter().sum();
        if total == 0 {
            return Err(SimulationError::InvariantViolation(
                "weighted choice with zero total weight".into(),
            ));
        }
        let mut draw = self.uniform(total)?;
        for (i, w) in weights.iter().enumerate() {
            if draw < *w {
                return Ok(i);
            }
            draw -= w;
        }
        Ok(weights.len() - 1)
    }

    /// Unrecorded fraction in `[0, 1)` for timing noise.
    pub fn fraction(&mut self) -> f64 {
        self.timing_rng.gen::<f64>()
    }

    /// Start a new path. Returns true on a phase change.
    pub fn begin_path(&mut self) -> bool {
        let path_len = self.search_choices.len();
        let changed = match self.search.as_mut() {
            Some(search) => search.advance(path_len, &mut self.rng),
            None => false,
        };
        if changed {
            if let Some(search) = &self.search {
                self.phase = format!("depth {}", search.depth);
                info!(depth = search.depth, "Searching up to a deeper depth");
            }
        }
        self.position = 0;
        self.search_choices.clear();
        self.random_choices.clear();
        self.timing_rng = ChaCha8Rng::seed_from_u64(self.seed);
        changed
    }

    /// Whether another path remains to be explored.
    pub fn has_next(&self, live: bool) -> bool {
        let more = match (&self.strategy, &self.search) {
            (ChoiceStrategy::Search, Some(search)) => search.has_next(self.search_choices.len()),
            (ChoiceStrategy::Replay, _) => false,
            _ => true,
        };
        debug!(more, live, path = %self.describe(), "Checked for more paths");
        more
    }

    /// Where the current step sits relative to the search prefix.
    ///
    /// `>= 0` once past it (0 if no random choice has been made yet, 1
    /// otherwise), -2 while replaying a prefix, -1 inside the part of the
    /// search tree fixed by earlier paths.
    pub fn test_search_depth(&self) -> i32 {
        match &self.search {
            Some(search) => {
                if self.search_choices.len() >= search.out_of.len() {
                    if self.random_choices.is_empty() {
                        0
                    } else {
                        1
                    }
                } else if self.position < self.prefix.len() {
                    -2
                } else {
                    -1
                }
            }
            None => {
                if self.position < self.prefix.len() {
                    -2
                } else {
                    1
                }
            }
        }
    }

    /// Whether the enumerated part of the path is complete.
    pub fn path_is_done(&self) -> bool {
        match &self.search {
            Some(search) => self.search_choices.len() == search.depth,
            None => true,
        }
    }

    /// Number of choices made on this path.
    pub fn path_depth(&self) -> usize {
        self.position
    }

    /// Values of the enumerated choices of this path.
    pub fn search_path(&self) -> Vector<u64> {
        self.search_choices.iter().map(|c| c.value).collect()
    }

    /// Every choice made so far on this path, in order.
    pub fn choices(&self) -> Vec<Choice> {
        self.snapshot().into_iter().collect()
    }

    /// The choices of [`choices`](Self::choices) as a persistent vector that
    /// shares structure with this path.
    pub fn snapshot(&self) -> Vector<Choice> {
        let consumed = self.position.min(self.prefix.len());
        let mut all = self.prefix.take(consumed);
        all.append(self.search_choices.clone());
        all.append(self.random_choices.clone());
        all
    }

    /// Current phase label.
    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// One-line summary for logs.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "ChoicePath<{:?},position={},searchlen={},walklen={}>",
            self.strategy,
            self.position,
            self.search_choices.len(),
            self.random_choices.len()
        );
        if let Some(search) = &self.search {
            let _ = write!(out, " depth={} sequence={:?}", search.depth, search.selections);
        }
        out
    }

    /// Write this path's choices in the choice-file format.
    pub fn write_path(&self, path: &Path, comment: &str) -> Result<(), SimulationError> {
        let mut out = String::new();
        for line in comment.lines() {
            let _ = writeln!(out, "# {line}");
        }
        let _ = writeln!(out, "# {}", self.describe());
        write_choices(path, out, &self.snapshot())
    }
}

/// Write `choices` in the choice-file format below the `#` lines in `header`.
pub(crate) fn write_choices(
    path: &Path,
    mut header: String,
    choices: &Vector<Choice>,
) -> Result<(), SimulationError> {
    for choice in choices {
        let _ = writeln!(header, "{} {}", choice.out_of, choice.value);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, header)?;
    Ok(())
}

/// Parse a choice file: one `out_of value` pair per line, `#` starts a comment.
pub fn parse_choices(text: &str, source: &Path) -> Result<Vec<Choice>, SimulationError> {
    let mut choices = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let err = |reason: &str| SimulationError::ChoiceFile {
            path: source.to_path_buf(),
            line: idx + 1,
            reason: reason.to_string(),
        };
        let mut parts = line.split_whitespace();
        let out_of = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| err("expected `out_of value`"))?;
        let value = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| err("expected `out_of value`"))?;
        if parts.next().is_some() {
            return Err(err("trailing tokens"));
        }
        if value >= out_of {
            return Err(err("value out of range"));
        }
        choices.push(Choice { out_of, value });
    }
    Ok(choices)
}

/// Read and parse a choice file.
pub fn read_choice_file(path: &Path) -> Result<Vec<Choice>, SimulationError> {
    let text = fs::read_to_string(path)?;
    parse_choices(&text, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trivial_choices_are_not_recorded() {
        let mut path = ChoicePath::random(7);
        assert_eq!(path.uniform(1).unwrap(), 0);
        assert_eq!(path.uniform(0).unwrap(), 0);
        assert_eq!(path.path_depth(), 0);
        assert!(path.choices().is_empty());
    }

    #[test]
    fn test_random_is_deterministic_per_seed() {
        let mut a = ChoicePath::random(42);
        let mut b = ChoicePath::random(42);
        let xs: Vec<u64> = (0..20).map(|_| a.uniform(10).unwrap()).collect();
        let ys: Vec<u64> = (0..20).map(|_| b.uniform(10).unwrap()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_search_enumerates_binary_tree() {
        // Depth 2 over binary choices visits 00, 01, 10, 11 then deepens.
        let mut path = ChoicePath::search(0, 2, 2, 10);
        let mut seen = Vec::new();
        loop {
            path.begin_path();
            let a = path.uniform(2).unwrap();
            let b = path.uniform(2).unwrap();
            assert!(path.path_is_done());
            seen.push((a, b));
            if !path.has_next(true) {
                break;
            }
        }
        assert_eq!(seen, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_search_deepens_after_exhausting_depth() {
        let mut path = ChoicePath::search(0, 1, usize::MAX, 10);
        path.begin_path();
        path.uniform(2).unwrap();
        path.uniform(2).unwrap();
        assert!(path.has_next(true));
        assert!(!path.begin_path());
        assert_eq!(path.uniform(2).unwrap(), 1);
        path.uniform(2).unwrap();
        assert!(path.has_next(true));
        assert!(path.begin_path());
        assert_eq!(path.phase(), "depth 2");
        assert_eq!(path.uniform(2).unwrap(), 0);
        assert_eq!(path.uniform(2).unwrap(), 0);
    }

    #[test]
    fn test_search_stops_when_paths_end_early() {
        // Paths shorter than the depth exhaust the search without deepening.
        let mut path = ChoicePath::search(0, 5, usize::MAX, 10);
        path.begin_path();
        path.uniform(2).unwrap();
        assert!(path.has_next(true));
        path.begin_path();
        assert_eq!(path.uniform(2).unwrap(), 1);
        assert!(!path.has_next(true));
    }

    #[test]
    fn test_search_detects_changed_branching() {
        let mut path = ChoicePath::search(0, 3, usize::MAX, 10);
        path.begin_path();
        path.uniform(2).unwrap();
        path.uniform(3).unwrap();
        path.begin_path();
        path.uniform(2).unwrap();
        assert!(matches!(
            path.uniform(4),
            Err(SimulationError::Nondeterminism {
                position: 1,
                expected: 3,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_test_search_depth_window() {
        let mut path = ChoicePath::search(0, 2, usize::MAX, 10);
        path.begin_path();
        assert_eq!(path.test_search_depth(), 0);
        path.uniform(2).unwrap();
        path.uniform(2).unwrap();
        assert_eq!(path.test_search_depth(), 0);
        path.uniform(2).unwrap();
        assert_eq!(path.test_search_depth(), 1);

        path.begin_path();
        // Second path re-walks the fixed part of the tree first.
        assert_eq!(path.test_search_depth(), -1);
    }

    #[test]
    fn test_weighted_mode_skips_zero_weights() {
        let mut path = ChoicePath::random(3).with_weighted(true);
        for _ in 0..50 {
            assert_eq!(path.weighted(&[0, 5, 0]).unwrap(), 1);
        }
        let mut uniform = ChoicePath::random(3);
        let picks: Vec<usize> = (0..50).map(|_| uniform.weighted(&[0, 5]).unwrap()).collect();
        assert!(picks.contains(&0));
    }

    #[test]
    fn test_replay_reproduces_and_detects_mismatch() {
        let mut original = ChoicePath::random(11);
        let values: Vec<u64> = (0..5).map(|_| original.uniform(6).unwrap()).collect();

        let mut replay = ChoicePath::replay(99, original.choices());
        let replayed: Vec<u64> = (0..5).map(|_| replay.uniform(6).unwrap()).collect();
        assert_eq!(values, replayed);
        assert!(!replay.has_next(true));

        let mut bad = ChoicePath::replay(0, original.choices());
        assert!(matches!(
            bad.uniform(7),
            Err(SimulationError::Nondeterminism { position: 0, .. })
        ));
    }

    #[test]
    fn test_choice_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("error0.path");
        let mut path = ChoicePath::random(5);
        for _ in 0..4 {
            path.uniform(3).unwrap();
        }
        path.write_path(&file, "PROPERTY_FAILED::demo").unwrap();
        let text = fs::read_to_string(&file).unwrap();
        assert!(text.starts_with("# PROPERTY_FAILED::demo"));
        assert_eq!(read_choice_file(&file).unwrap(), path.choices());
    }

    #[test]
    fn test_parse_choices_errors() {
        let src = Path::new("x.path");
        assert!(matches!(
            parse_choices("3 1\n2 5\n", src),
            Err(SimulationError::ChoiceFile { line: 2, .. })
        ));
        assert!(parse_choices("# only comments\n\n", src).unwrap().is_empty());
    }
}
