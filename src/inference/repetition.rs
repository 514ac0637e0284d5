//! Repetition guard
//!
//! Detects degenerate loops in streaming model output and requests
//! early termination, so a looping model stops after a small multiple
//! of the loop period instead of running to the token limit.
//! Repetition-penalty sampling reduces loop degeneration in small
//! local models but does not eliminate it, and a single global rule
//! misses loops at other granularities. The detectors here form a
//! cascade over five granularities:
//!
//! 1. metadata-line exact repeat (zero tolerance)
//! 2. exact line fingerprint duplicates (third occurrence stops)
//! 3. near-duplicate lines by edit-distance similarity
//! 4. distributed periodic patterns (A-B-A-B cycles)
//! 5. block-level substring repetition
//!
//! plus per-token checks for character/word/keyword spam. Every check
//! is O(window); nothing scans the full accumulated output.
//!
//! State is strictly per generation call: the engine builds a fresh
//! guard for every call, including retries after cancellation.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use regex::Regex;

/// Lines annotating a file name or path, a common loop seed when a
/// model regurgitates prompt headers.
static METADATA_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?://|#|--|/\*)?\s*(?:file(?:path|name)?|path)\s*:\s*\S")
        .expect("static pattern")
});

/// Leaked FIM keywords cycling back to back (`prefix|suffix|prefix...`).
static FIM_KEYWORD_LOOP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:(?:prefix|suffix|middle|fim)[\s|_:]*){3,}").expect("static pattern")
});

/// Tuning knobs for the guard. The defaults are empirically tuned
/// values, not derived from a formal model; they are exposed here
/// rather than hard-coded so callers can adjust them.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Ring buffer size for recent non-empty lines.
    pub window_lines: usize,
    /// Shortest line (in chars) that gets fingerprinted; anything
    /// shorter is too common in real code (braces, `end`, `fi`) to
    /// count as repetition.
    pub min_fingerprint_chars: usize,
    /// Occurrence count at which an exact duplicate terminates.
    pub max_fingerprint_occurrences: u32,
    /// Similarity above this is a near-duplicate.
    pub similarity_threshold: f64,
    /// Run the periodic-pattern check every this many buffered lines.
    pub periodic_check_interval: usize,
    /// Minimum buffered lines before the periodic check applies. A
    /// detected cycle must also span at least this many lines.
    pub min_periodic_lines: usize,
    /// Block sizes (chars) compared against the preceding block.
    pub block_sizes: [usize; 2],
    /// Blocks at or below this many trimmed chars are ignored.
    pub min_block_chars: usize,
    /// Tail window (chars) for the per-token keyword check.
    pub tail_window_chars: usize,
    /// Contiguous repeats of a word (>= 4 chars) that terminate.
    pub max_word_repeats: usize,
    /// Run length of a single non-whitespace char that terminates.
    pub max_char_run: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window_lines: 20,
            min_fingerprint_chars: 5,
            max_fingerprint_occurrences: 3,
            similarity_threshold: 0.9,
            periodic_check_interval: 4,
            min_periodic_lines: 6,
            block_sizes: [50, 100],
            min_block_chars: 20,
            tail_window_chars: 50,
            max_word_repeats: 5,
            max_char_run: 15,
        }
    }
}

/// Which detector requested termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MetadataRepeat,
    DuplicateLine,
    NearDuplicateLine,
    PeriodicPattern,
    RepeatedBlock,
    DegenerateTokens,
}

#[derive(Debug, PartialEq, Eq)]
enum GuardState {
    Active,
    Terminated,
}

/// Multi-granularity loop detector over a live completion stream.
pub struct RepetitionGuard {
    config: GuardConfig,
    state: GuardState,
    /// Last `window_lines` non-empty lines, trimmed.
    lines: VecDeque<String>,
    /// Fingerprint hash -> occurrence count this call. Bounded by the
    /// number of lines produced in the call, never by total history.
    fingerprints: HashMap<u64, u32>,
    exact_duplicate_seen: bool,
    lines_since_periodic_check: usize,
}

impl RepetitionGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            state: GuardState::Active,
            lines: VecDeque::new(),
            fingerprints: HashMap::new(),
            exact_duplicate_seen: false,
            lines_since_periodic_check: 0,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == GuardState::Terminated
    }

    /// Run the line-granularity cascade on a newly completed line.
    /// `full_text` is the whole accumulated completion; only its tail
    /// is inspected.
    pub fn on_line(&mut self, line: &str, full_text: &str) -> Option<StopReason> {
        if self.state == GuardState::Terminated {
            return None;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        // 1. Metadata lines repeat with zero tolerance.
        if METADATA_LINE.is_match(trimmed) && self.lines.iter().any(|l| l == trimmed) {
            return Some(self.trip(StopReason::MetadataRepeat));
        }

        // 2. Exact fingerprint duplicates; two prior occurrences are
        // tolerated.
        let mut caught_exact = false;
        if trimmed.chars().count() >= self.config.min_fingerprint_chars {
            let count = self
                .fingerprints
                .entry(fingerprint(trimmed))
                .or_insert(0);
            *count += 1;
            if *count >= 2 {
                self.exact_duplicate_seen = true;
            }
            if *count >= self.config.max_fingerprint_occurrences {
                caught_exact = true;
            }
        }
        if caught_exact {
            return Some(self.trip(StopReason::DuplicateLine));
        }

        // 3. Near-duplicates, only once an exact duplicate has shown
        // up; exact matches are rule 2's business.
        if self.exact_duplicate_seen
            && trimmed.chars().count() >= self.config.min_fingerprint_chars
        {
            let threshold = self.config.similarity_threshold;
            let near = self
                .lines
                .iter()
                .any(|prev| prev != trimmed && similarity(prev, trimmed) > threshold);
            if near {
                return Some(self.trip(StopReason::NearDuplicateLine));
            }
        }

        self.lines.push_back(trimmed.to_string());
        if self.lines.len() > self.config.window_lines {
            self.lines.pop_front();
        }
        self.lines_since_periodic_check += 1;

        // 4. Distributed periodic patterns, checked every few lines.
        if self.lines_since_periodic_check >= self.config.periodic_check_interval
            && self.lines.len() >= self.config.min_periodic_lines
        {
            self.lines_since_periodic_check = 0;
            if self.has_periodic_cycle() {
                return Some(self.trip(StopReason::PeriodicPattern));
            }
        }

        // 5. Block-level repetition over the text tail.
        if self.has_repeated_block(full_text) {
            return Some(self.trip(StopReason::RepeatedBlock));
        }

        None
    }

    /// Per-token degenerate-repeat checks, independent of line
    /// completion: char runs, contiguous word repeats, and leaked FIM
    /// keyword alternation.
    pub fn on_token(&mut self, full_text: &str) -> Option<StopReason> {
        if self.state == GuardState::Terminated {
            return None;
        }

        let scan = tail_chars(full_text, self.config.tail_window_chars * 2);

        if has_char_run(scan, self.config.max_char_run)
            || has_word_repeat(scan, self.config.max_word_repeats)
        {
            return Some(self.trip(StopReason::DegenerateTokens));
        }

        let keyword_window = tail_chars(full_text, self.config.tail_window_chars);
        if FIM_KEYWORD_LOOP.is_match(keyword_window) {
            return Some(self.trip(StopReason::DegenerateTokens));
        }

        None
    }

    fn trip(&mut self, reason: StopReason) -> StopReason {
        self.state = GuardState::Terminated;
        tracing::debug!(?reason, buffered_lines = self.lines.len(), "repetition guard tripped");
        reason
    }

    /// True when the buffered suffix decomposes into a cycle of period
    /// `p` repeated `k` times with `p * k` spanning at least
    /// `min_periodic_lines` lines and `k >= 2`.
    fn has_periodic_cycle(&self) -> bool {
        let lines: Vec<&String> = self.lines.iter().collect();
        let n = lines.len();
        for period in 1..=n / 2 {
            let mut repeats = 1;
            loop {
                let end = n - repeats * period;
                if end < period {
                    break;
                }
                let matches = (0..period)
                    .all(|i| lines[end - period + i] == lines[n - period + i]);
                if !matches {
                    break;
                }
                repeats += 1;
            }
            if repeats >= 2 && repeats * period >= self.config.min_periodic_lines {
                return true;
            }
        }
        false
    }

    /// Compare the last `block` chars against the immediately
    /// preceding block of the same size.
    fn has_repeated_block(&self, text: &str) -> bool {
        for &block in &self.config.block_sizes {
            let window = tail_chars(text, block * 2);
            if window.chars().count() < block * 2 {
                continue;
            }
            let Some((mid, _)) = window.char_indices().nth(block) else {
                continue;
            };
            let (prev, tail) = window.split_at(mid);
            let tail_trimmed = tail.trim();
            if tail_trimmed.chars().count() <= self.config.min_block_chars {
                continue;
            }
            if tail == prev || prev.contains(tail_trimmed) {
                return true;
            }
        }
        false
    }
}

/// Content hash for exact-duplicate detection.
fn fingerprint(line: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    line.hash(&mut hasher);
    hasher.finish()
}

/// Last `n` chars of `text` as a subslice (char-boundary safe, O(n)).
fn tail_chars(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match text.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// A single non-whitespace char repeated `limit` or more times at any
/// point in `scan`. Whitespace runs are excluded: long indentation is
/// normal in code.
fn has_char_run(scan: &str, limit: usize) -> bool {
    let mut run = 0usize;
    let mut last: Option<char> = None;
    for c in scan.chars() {
        if Some(c) == last {
            run += 1;
        } else {
            run = 1;
            last = Some(c);
        }
        if run >= limit && !c.is_whitespace() {
            return true;
        }
    }
    false
}

/// A word of >= 4 chars repeated `limit` or more times contiguously,
/// either whitespace-separated or back to back with no separator.
/// The regex crate has no backreferences, so both forms are explicit
/// scans.
fn has_word_repeat(scan: &str, limit: usize) -> bool {
    // Whitespace-separated: the last `limit` words are identical.
    let words: Vec<&str> = scan.split_whitespace().collect();
    if words.len() >= limit {
        let tail = &words[words.len() - limit..];
        let first = tail[0];
        if first.chars().count() >= 4 && tail.iter().all(|w| *w == first) {
            return true;
        }
    }

    // Back to back: the tail is one chunk repeated `limit` times.
    let chars: Vec<char> = scan.chars().collect();
    for width in 4..=12 {
        let span = width * limit;
        if chars.len() < span {
            break;
        }
        let tail = &chars[chars.len() - span..];
        let chunk = &tail[..width];
        if chunk.iter().all(|c| !c.is_whitespace())
            && tail.chunks(width).all(|c| c == chunk)
        {
            return true;
        }
    }
    false
}

/// Normalized edit-distance similarity in [0, 1].
fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a_len = a.chars().count();
    let b_len = b.chars().count();
    let max_len = a_len.max(b_len);
    if max_len == 0 {
        return 1.0;
    }
    // Quick reject: length difference alone already bounds similarity.
    let diff = a_len.abs_diff(b_len);
    if diff == max_len {
        return 0.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Classic two-row Levenshtein distance over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> RepetitionGuard {
        RepetitionGuard::new(GuardConfig::default())
    }

    /// Feed lines as if each had just been completed, maintaining the
    /// accumulated text the engine would hold.
    fn feed(guard: &mut RepetitionGuard, lines: &[&str]) -> Option<(usize, StopReason)> {
        let mut text = String::new();
        for (i, line) in lines.iter().enumerate() {
            text.push_str(line);
            text.push('\n');
            if let Some(reason) = guard.on_line(line, &text) {
                return Some((i, reason));
            }
        }
        None
    }

    #[test]
    fn test_metadata_repeat_trips_on_second() {
        let mut g = guard();
        let hit = feed(
            &mut g,
            &["// File: src/main.rs", "fn main() {", "// File: src/main.rs"],
        );
        assert_eq!(hit, Some((2, StopReason::MetadataRepeat)));
        assert!(g.is_terminated());
    }

    #[test]
    fn test_exact_duplicate_trips_on_third() {
        let mut g = guard();
        let line = "let total = total + 1;";
        let hit = feed(&mut g, &[line, "something else entirely", line, line]);
        assert_eq!(hit, Some((3, StopReason::DuplicateLine)));
    }

    #[test]
    fn test_two_occurrences_tolerated() {
        let mut g = guard();
        let line = "let total = total + 1;";
        assert_eq!(feed(&mut g, &[line, "other line here", line]), None);
        assert!(!g.is_terminated());
    }

    #[test]
    fn test_short_lines_not_fingerprinted() {
        let mut g = guard();
        // Closing braces repeat constantly in real code.
        assert_eq!(feed(&mut g, &["}", "}", "}", "}", "}"]), None);
    }

    #[test]
    fn test_line_at_length_threshold_is_fingerprinted() {
        let mut g = guard();
        let line = "x-=2;"; // exactly min_fingerprint_chars long
        assert_eq!(line.chars().count(), GuardConfig::default().min_fingerprint_chars);
        let hit = feed(&mut g, &[line, "other statement", line, line]);
        assert_eq!(hit, Some((3, StopReason::DuplicateLine)));
    }

    #[test]
    fn test_near_duplicate_after_exact_duplicate() {
        let mut g = guard();
        let hit = feed(
            &mut g,
            &[
                "println!(\"count = {}\", count);",
                "println!(\"count = {}\", count);",
                "let value = compute_thing(1);",
                "let value = compute_thing(2);",
            ],
        );
        assert_eq!(hit, Some((3, StopReason::NearDuplicateLine)));
    }

    #[test]
    fn test_near_duplicate_requires_prior_exact() {
        let mut g = guard();
        let hit = feed(
            &mut g,
            &[
                "let value = compute_thing(1);",
                "let value = compute_thing(2);",
            ],
        );
        assert_eq!(hit, None);
    }

    #[test]
    fn test_periodic_cycle_of_three() {
        let mut g = guard();
        let hit = feed(
            &mut g,
            &[
                "alpha one", "beta two", "gamma three",
                "alpha one", "beta two", "gamma three",
            ],
        );
        assert_eq!(hit, Some((5, StopReason::PeriodicPattern)));
    }

    #[test]
    fn test_alternating_pair_trips_by_sixth_line() {
        let mut g = guard();
        let hit = feed(
            &mut g,
            &["line aa", "line bb", "line aa", "line bb", "line aa", "line bb"],
        );
        let (index, _) = hit.expect("should terminate");
        assert!(index <= 5, "tripped at line {index}");
    }

    #[test]
    fn test_no_periodic_false_positive_on_distinct_lines() {
        let mut g = guard();
        let lines: Vec<String> = (0..12).map(|i| format!("statement number {i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        assert_eq!(feed(&mut g, &refs), None);
    }

    #[test]
    fn test_block_repetition() {
        let mut g = guard();
        let block = "val += 1; ".repeat(5); // exactly 50 chars
        let text = block.repeat(2);
        let hit = g.on_line("tail line after block", &text);
        assert_eq!(hit, Some(StopReason::RepeatedBlock));
    }

    #[test]
    fn test_block_needs_enough_text() {
        let mut g = guard();
        // Fewer than 100 chars: no full block pair to compare.
        let text = "val += 1; ".repeat(9);
        let hit = g.on_line("tail line after block", &text);
        assert_eq!(hit, None);
    }

    #[test]
    fn test_char_run_trips() {
        let mut g = guard();
        let text = format!("let x = 1; {}", ">".repeat(16));
        assert_eq!(g.on_token(&text), Some(StopReason::DegenerateTokens));
    }

    #[test]
    fn test_indentation_run_allowed() {
        let mut g = guard();
        let text = format!("{}value", " ".repeat(24));
        assert_eq!(g.on_token(&text), None);
    }

    #[test]
    fn test_word_repeat_trips() {
        let mut g = guard();
        assert_eq!(
            g.on_token("data data data data data"),
            Some(StopReason::DegenerateTokens)
        );
    }

    #[test]
    fn test_word_repeat_without_separator() {
        let mut g = guard();
        assert_eq!(
            g.on_token("loop-loop-loop-loop-loop-"),
            Some(StopReason::DegenerateTokens)
        );
    }

    #[test]
    fn test_fim_keyword_alternation() {
        let mut g = guard();
        assert_eq!(
            g.on_token("prefix|suffix|prefix|suffix|prefix"),
            Some(StopReason::DegenerateTokens)
        );
    }

    #[test]
    fn test_normal_text_passes_token_checks() {
        let mut g = guard();
        assert_eq!(g.on_token("fn compute(input: &str) -> usize {"), None);
    }

    #[test]
    fn test_terminated_guard_stays_quiet() {
        let mut g = guard();
        let line = "let total = total + 1;";
        assert!(feed(&mut g, &[line, line, line]).is_some());
        assert!(g.is_terminated());
        assert_eq!(g.on_line(line, line), None);
        assert_eq!(g.on_token(line), None);
    }

    #[test]
    fn test_similarity_metric() {
        assert!((similarity("abcd", "abcd") - 1.0).abs() < 1e-9);
        assert!(similarity("abcd", "wxyz") < 0.1);
        let a = "let value = compute_thing(1);";
        let b = "let value = compute_thing(2);";
        assert!(similarity(a, b) > 0.9);
    }

    #[test]
    fn test_levenshtein_basics() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
