//! Terminal escape stripping.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

/// CSI sequences (colors, cursor movement), OSC sequences terminated by BEL or
/// ST, and two-byte escapes.
const ANSI_PATTERN: &str =
    r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]";

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ANSI_PATTERN).expect("ANSI pattern is a valid regex"))
}

/// Remove ANSI/terminal control sequences. Borrows when there is nothing to strip.
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    if !line.contains('\x1b') {
        return Cow::Borrowed(line);
    }
    ansi_regex().replace_all(line, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("\x1b[2m2024-05-01T10:00:00Z\x1b[0m \x1b[32m INFO\x1b[0m hello", "2024-05-01T10:00:00Z  INFO hello")]
    #[case("\x1b[1;31merror\x1b[39;49m", "error")]
    #[case("\x1b]0;title\x07plain", "plain")]
    #[case("no escapes here", "no escapes here")]
    fn strips_sequences(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_ansi(input), expected);
    }

    #[test]
    fn borrows_when_clean() {
        assert!(matches!(strip_ansi("clean"), Cow::Borrowed(_)));
    }
}
