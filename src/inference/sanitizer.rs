//! FIM control-token sanitizer
//!
//! Fill-in-the-middle prompting uses reserved control tokens
//! (`<|fim_prefix|>`, `<PRE>`, `[PREFIX]`, `{|fim_prefix|}`, ...) that
//! small local models sometimes echo back into the completion. This
//! module removes every known spelling family, plus the debris their
//! partial or escaped variants leave behind.
//!
//! [`sanitize`] is pure and idempotent: each removal pass runs to a
//! fixpoint, so `sanitize(sanitize(x)) == sanitize(x)` for all inputs.

use once_cell::sync::Lazy;
use regex::Regex;

/// Complete control-token spelling families, in removal order. Every
/// pattern tolerates whitespace padding and backslash-escaped
/// delimiters.
static TOKEN_GRAMMAR: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        (
            "angle-fim",
            r"(?i)\\?<\s*\\?\|\s*/?\s*fim[^<>|]*\\?\|\s*\\?>",
        ),
        ("angle-tag", r"\\?<\s*(?:PRE|SUF|MID)\s*\\?>"),
        ("square", r"\\?\[\s*(?:PREFIX|SUFFIX|MIDDLE)\s*\\?\]"),
        // Curly-pipe family, including the generic {|...|} catch-all
        // for spellings we have not seen yet. Known heuristic tail.
        ("curly-pipe", r"\\?\{\s*\\?\|[^{}]*\\?\|\s*\\?\}"),
    ]
    .into_iter()
    .map(|(name, pattern)| {
        (
            name,
            Regex::new(pattern).unwrap_or_else(|e| panic!("bad {name} pattern: {e}")),
        )
    })
    .collect()
});

/// Truncated token fragments (`<|fim_` with no closing bracket and the
/// curly equivalent), stripped inline during the per-line pass.
static TRUNCATED_FRAGMENTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)<\s*\|\s*fim[^<>|]*", r"(?i)\{\s*\|\s*fim[^{}|]*"]
        .into_iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
});

/// Dangling `{|` followed by whitespace or end of line. The
/// word-attached form (`{|fim...`) is left for the per-line pass so
/// its keyword is not orphaned.
static DANGLING_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)\{\s*\|(\s|$)").expect("static pattern"));

/// Dangling `|}` left behind after token removal.
static DANGLING_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\|\s*\}").expect("static pattern"));

/// A pipe or doubled pipe surrounded only by whitespace. Treated as
/// sanitizer debris. Known false positive: a legitimate bitwise-or (or
/// logical-or) standing alone between spaces is removed too.
static ISOLATED_PIPES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(^|[ \t])\|{1,2}([ \t]|$)").expect("static pattern"));

/// A line consisting solely of a partial/unclosed control token or its
/// leftovers.
static PARTIAL_TOKEN_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^\s*(?:
              <\s*\|[^<>]*                            # unclosed angle token
            | \{\s*\|[^{}]*                           # unclosed curly token
            | \|\s*[}>]                               # orphaned close
            | \[\s*(?:PREFIX|SUFFIX|MIDDLE)[^\]]*     # unclosed square token
            | \{\s*\}                                 # empty braces left by removal
            | \|+                                     # bare pipes
        )\s*$",
    )
    .expect("static pattern")
});

static NEWLINE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("static pattern"));

/// Replace every match of `re` with `rep`, repeating until the text
/// stops changing, so removals never expose a fresh match to a later
/// pass.
fn replace_to_fixpoint(re: &Regex, text: String, rep: &str) -> String {
    let mut current = text;
    loop {
        let next = re.replace_all(&current, rep);
        if next == current {
            return current;
        }
        current = next.into_owned();
    }
}

/// Remove model-family-specific FIM control tokens and their debris
/// from a finished completion. Pure and idempotent.
pub fn sanitize(text: &str) -> String {
    // Pass 1: the complete-token grammar.
    let mut out = text.to_string();
    loop {
        let before = out.clone();
        for (_, re) in TOKEN_GRAMMAR.iter() {
            out = replace_to_fixpoint(re, out, "");
        }
        if out == before {
            break;
        }
    }

    // Pass 2: orphaned artifacts.
    out = replace_to_fixpoint(&DANGLING_OPEN, out, "${1}");
    out = replace_to_fixpoint(&DANGLING_CLOSE, out, "");
    out = replace_to_fixpoint(&ISOLATED_PIPES, out, "${1}${2}");

    // Pass 3: drop lines that are nothing but a partial token, then
    // strip remaining inline truncated fragments. A line emptied by
    // the inline strip is dropped too; genuinely blank lines stay.
    let mut kept: Vec<String> = Vec::new();
    let mut dropped = 0usize;
    for line in out.lines() {
        if !line.trim().is_empty() && PARTIAL_TOKEN_LINE.is_match(line) {
            dropped += 1;
            continue;
        }
        let mut cleaned = line.to_string();
        for re in TRUNCATED_FRAGMENTS.iter() {
            cleaned = replace_to_fixpoint(re, cleaned, "");
        }
        if cleaned.trim().is_empty() && !line.trim().is_empty() {
            dropped += 1;
            continue;
        }
        kept.push(cleaned);
    }
    if dropped > 0 {
        tracing::debug!(dropped, "dropped partial control-token lines");
    }
    let joined = kept.join("\n");

    // Pass 4: collapse newline runs introduced by removed lines.
    NEWLINE_RUN
        .replace_all(&joined, "\n\n")
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removes_angle_fim_tokens() {
        assert_eq!(
            sanitize("<|fim_prefix|>fn main()<|fim_suffix|> {}<|fim_middle|>"),
            "fn main() {}"
        );
    }

    #[test]
    fn test_removes_codellama_tags() {
        assert_eq!(sanitize("<PRE>let x = 1;<SUF><MID>"), "let x = 1;");
    }

    #[test]
    fn test_removes_square_tokens() {
        assert_eq!(sanitize("[PREFIX]code here[SUFFIX]"), "code here");
    }

    #[test]
    fn test_removes_curly_pipe_tokens() {
        assert_eq!(
            sanitize("{|fim_prefix|}return 42;{|fim_suffix|}"),
            "return 42;"
        );
    }

    #[test]
    fn test_generic_curly_catch_all() {
        assert_eq!(sanitize("{|something_new|}value"), "value");
    }

    #[test]
    fn test_curly_fim_runs_removed_surrounding_chars_kept() {
        let input = "{|fim|}>>>>>> {|fim|}>>>>>{|fim|}>>>>>{|fim|}>>>>>{|fim|}>>>>>";
        assert_eq!(sanitize(input), ">>>>>> >>>>>>>>>>>>>>>>>>>>");
    }

    #[test]
    fn test_preserves_legitimate_code() {
        let input = "const obj = { key: \"value\" };";
        assert_eq!(sanitize(input), input);
    }

    #[test]
    fn test_preserves_plain_code_block() {
        let input = "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}";
        assert_eq!(sanitize(input), input);
    }

    #[test]
    fn test_escaped_variants() {
        assert_eq!(sanitize(r"\<\|fim_prefix\|\>code"), "code");
    }

    #[test]
    fn test_whitespace_tolerant_variants() {
        assert_eq!(sanitize("< | fim_prefix | >code"), "code");
    }

    #[test]
    fn test_truncated_inline_fragment() {
        assert_eq!(sanitize("let y = 2; <|fim_suf"), "let y = 2;");
    }

    #[test]
    fn test_drops_partial_token_only_lines() {
        let input = "line one\n<|fim_\nline two";
        assert_eq!(sanitize(input), "line one\nline two");
    }

    #[test]
    fn test_keeps_lone_brace_lines() {
        // Opening/closing braces on their own lines are normal code.
        let input = "if ready {\n    go();\n}";
        assert_eq!(sanitize(input), input);
    }

    #[test]
    fn test_isolated_pipe_removed() {
        assert_eq!(sanitize("a | b"), "a  b");
    }

    #[test]
    fn test_attached_pipe_preserved() {
        assert_eq!(sanitize("let z = a|b;"), "let z = a|b;");
    }

    #[test]
    fn test_collapses_newline_runs() {
        assert_eq!(sanitize("a\n\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn test_trims_trailing_whitespace() {
        assert_eq!(sanitize("code here   \n\n"), "code here");
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "{|fim|}>>>>>> {|fim|}>>>>>{|fim|}>>>>>{|fim|}>>>>>{|fim|}>>>>>",
            "<|fim_prefix|>fn main() {}\n<|fim_\n\n\n\nmore",
            "const obj = { key: \"value\" };",
            "a | b || c\n{|\n|}\n<PRE>[PREFIX]",
            "",
            "plain text with no artifacts",
        ];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(sanitize(""), "");
    }
}
