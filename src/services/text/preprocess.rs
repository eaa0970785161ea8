use regex::Regex;
use std::sync::LazyLock;

use super::segmenter::HeadingRules;
use crate::services::language::Language;

static SPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\u{00A0}]+").unwrap());
// The leading guard keeps "3.33:33" from matching again on a second pass.
static CLOCK_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)(^|[^\d:.])(\d{1,2}):(\d{2})\b").unwrap());
static BANGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!{2,}").unwrap());
static QUESTIONS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\?{2,}").unwrap());
static COMMAS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",{2,}").unwrap());
static SEMICOLONS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r";{2,}").unwrap());
static LONG_ELLIPSIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.{4,}").unwrap());

fn abbreviation_table(pairs: &[(&str, &str)]) -> Vec<(Regex, String)> {
    pairs
        .iter()
        .map(|(abbr, full)| {
            let pattern = format!(r"\b{}\.(\s)", regex::escape(abbr));
            (Regex::new(&pattern).unwrap(), format!("{}${{1}}", full))
        })
        .collect()
}

// Only titles followed by a name; a trailing period may end a sentence.
static ABBREVIATIONS_EN: LazyLock<Vec<(Regex, String)>> = LazyLock::new(|| {
    abbreviation_table(&[
        ("Mrs", "Missus"),
        ("Mr", "Mister"),
        ("Ms", "Miss"),
        ("Dr", "Doctor"),
        ("Prof", "Professor"),
    ])
});
static ABBREVIATIONS_ES: LazyLock<Vec<(Regex, String)>> = LazyLock::new(|| {
    abbreviation_table(&[
        ("Srta", "Señorita"),
        ("Sra", "Señora"),
        ("Sr", "Señor"),
        ("Dra", "Doctora"),
        ("Dr", "Doctor"),
        ("Prof", "Profesor"),
        ("Ud", "usted"),
        ("Uds", "ustedes"),
    ])
});

const UNPRONOUNCEABLE: &[char] = &['*', '#', '_', '~', '|', '<', '>', '\\', '`'];

/// Upper bound on extra passes in `TextPreprocessor::preprocess`.
const MAX_SETTLE_PASSES: usize = 4;

fn strip_unpronounceable(line: &str) -> String {
    let kept: String = line.chars().filter(|c| !UNPRONOUNCEABLE.contains(c)).collect();
    SPACE_RUN.replace_all(kept.trim(), " ").into_owned()
}

/// Replaces typographic quotes, dashes and ellipses with plain ASCII forms.
pub fn normalize_unicode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => out.push('"'),
            '\u{2018}' | '\u{2019}' | '\u{201A}' => out.push('\''),
            '\u{2014}' | '\u{2013}' | '\u{2012}' => out.push('-'),
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' | '\u{2009}' | '\u{202F}' => out.push(' '),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Trims lines, collapses space runs and squeezes blank-line runs to one.
pub fn normalize_lines(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = SPACE_RUN.replace_all(line.trim(), " ").into_owned();
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// True when nothing in `text` can be spoken.
pub fn is_only_punctuation(text: &str) -> bool {
    !text.chars().any(char::is_alphanumeric)
}

/// Closes a quote left open at the end of a block: right after the last
/// sentence-ending run that follows it, or at the very end. A quote with
/// nothing speakable after it is dropped instead.
pub fn fix_unterminated_quotes(block: &str) -> String {
    let mut open_at: Option<usize> = None;
    for (i, c) in block.char_indices() {
        if c == '"' {
            open_at = if open_at.is_some() { None } else { Some(i) };
        }
    }
    let Some(open) = open_at else {
        return block.to_string();
    };

    let tail = &block[open + 1..];
    if is_only_punctuation(tail) {
        let mut fixed = String::with_capacity(block.len());
        fixed.push_str(block[..open].trim_end_matches(' '));
        fixed.push_str(tail);
        return fixed;
    }
    let mut fixed = block.to_string();
    match tail.rfind(['.', '!', '?']) {
        Some(i) => fixed.insert(open + 1 + i + 1, '"'),
        None => {
            let end = fixed.trim_end().len();
            fixed.insert(end, '"');
        }
    }
    fixed
}

/// `"Hola".` becomes `"Hola."`. Only closing quotes attached to a word move.
fn move_punctuation_inside_quotes(block: &str) -> String {
    let chars: Vec<char> = block.chars().collect();
    let mut out = String::with_capacity(block.len());
    let mut open = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != '"' {
            out.push(c);
            i += 1;
            continue;
        }
        let attached = i > 0 && !chars[i - 1].is_whitespace() && chars[i - 1] != '"';
        if open && attached {
            let mut j = i + 1;
            while j < chars.len() && matches!(chars[j], '.' | '!' | '?') {
                out.push(chars[j]);
                j += 1;
            }
            out.push('"');
            i = j;
        } else {
            out.push('"');
            i += 1;
        }
        open = !open;
    }
    out
}

fn collapse_punctuation(line: &str) -> String {
    let line = BANGS.replace_all(line, "!");
    let line = QUESTIONS.replace_all(&line, "?");
    let line = COMMAS.replace_all(&line, ",");
    let line = SEMICOLONS.replace_all(&line, ";");
    LONG_ELLIPSIS.replace_all(&line, "...").into_owned()
}

fn ensure_terminal_punctuation(line: &str) -> String {
    if is_only_punctuation(line) || line.ends_with(['.', '!', '?', ';', ':', ',']) {
        return line.to_string();
    }
    if let Some(body) = line.strip_suffix('"') {
        // An opening quote or existing punctuation before it stays as is.
        return match body.chars().last() {
            Some(c) if c.is_alphanumeric() => format!("{}.\"", body),
            _ => line.to_string(),
        };
    }
    format!("{}.", line)
}

/// Normalizes text for speech without touching its words. Heading lines are
/// left as they are. Running it twice gives the same result as running it once.
pub struct TextPreprocessor {
    language: Language,
    rules: HeadingRules,
}

enum Piece {
    Heading(String),
    Block(Vec<String>),
}

impl TextPreprocessor {
    pub fn new(language: Language, rules: HeadingRules) -> Self {
        Self { language, rules }
    }

    pub fn preprocess(&self, text: &str) -> String {
        let mut current = self.clean_pass(text);
        // Closing a quote or adding a period can turn a body line into a
        // heading, which moves block boundaries on the following pass.
        for _ in 0..MAX_SETTLE_PASSES {
            let next = self.clean_pass(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    fn clean_pass(&self, text: &str) -> String {
        let text = normalize_lines(&normalize_unicode(text));
        let mut paragraphs = Vec::new();
        for paragraph in text.split("\n\n") {
            let mut lines = Vec::new();
            for piece in self.pieces(paragraph) {
                match piece {
                    Piece::Heading(line) => lines.push(line),
                    Piece::Block(block) => lines.extend(self.clean_block(&block.join("\n"))),
                }
            }
            if !lines.is_empty() {
                paragraphs.push(lines.join("\n"));
            }
        }
        paragraphs.join("\n\n")
    }

    /// Headings are recognised with markup removed, so `**NOTA:**` is one
    /// before and after cleaning.
    fn is_heading_line(&self, line: &str) -> bool {
        self.rules.is_heading(line) || self.rules.is_heading(&strip_unpronounceable(line))
    }

    /// Runs of body lines between heading lines.
    fn pieces(&self, paragraph: &str) -> Vec<Piece> {
        let mut pieces = Vec::new();
        let mut block: Vec<String> = Vec::new();
        for line in paragraph.lines().filter(|l| !l.is_empty()) {
            if self.is_heading_line(line) {
                if !block.is_empty() {
                    pieces.push(Piece::Block(std::mem::take(&mut block)));
                }
                pieces.push(Piece::Heading(line.to_string()));
            } else {
                block.push(line.to_string());
            }
        }
        if !block.is_empty() {
            pieces.push(Piece::Block(block));
        }
        pieces
    }

    fn clean_block(&self, block: &str) -> Vec<String> {
        let block = fix_unterminated_quotes(block);
        let block: String = block.chars().filter(|c| !UNPRONOUNCEABLE.contains(c)).collect();
        let block = move_punctuation_inside_quotes(&block);
        let block = CLOCK_TIME.replace_all(&block, "${1}${2}.${3}");

        let abbreviations = match self.language {
            Language::En => &*ABBREVIATIONS_EN,
            Language::Es => &*ABBREVIATIONS_ES,
        };
        block
            .lines()
            .map(|line| SPACE_RUN.replace_all(line.trim(), " ").into_owned())
            .filter(|line| !line.is_empty())
            .map(|line| {
                let mut line = collapse_punctuation(&line);
                for (pattern, full) in abbreviations {
                    line = pattern.replace_all(&line, full.as_str()).into_owned();
                }
                ensure_terminal_punctuation(&line)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn pre(lang: Language) -> TextPreprocessor {
        TextPreprocessor::new(lang, HeadingRules::new(lang, None))
    }

    #[test]
    fn test_unicode_normalization() {
        assert_eq!(
            normalize_unicode("\u{201C}Hola\u{201D} \u{2014} dijo\u{2026} \u{00AB}ya\u{00BB}"),
            "\"Hola\" - dijo... \"ya\""
        );
    }

    #[test]
    fn test_line_normalization() {
        assert_eq!(normalize_lines("  a   b \n\n\n\n c\t d\n\n"), "a b\n\nc d");
    }

    #[test]
    fn test_unterminated_quote_closed_at_sentence_boundary() {
        assert_eq!(fix_unterminated_quotes("\"Wait. he said"), "\"Wait.\" he said");
        assert_eq!(fix_unterminated_quotes("He said \"come here"), "He said \"come here\"");
        assert_eq!(fix_unterminated_quotes("Done. \""), "Done.");
        assert_eq!(fix_unterminated_quotes("\"ok\" fine"), "\"ok\" fine");
    }

    #[test]
    fn test_full_pipeline_en() {
        let text = "Chapter 1\nThe Start\n\n\u{201C}Hello\u{201D}. Mr. Smith arrived at 3:30\n**Note** it works!!!";
        let out = pre(Language::En).preprocess(text);
        assert_eq!(
            out,
            "Chapter 1\nThe Start.\n\n\"Hello.\" Mister Smith arrived at 3.30.\nNote it works!"
        );
    }

    #[test]
    fn test_spanish_abbreviations_and_dialogue() {
        let out = pre(Language::Es).preprocess("La Sra. Pérez respondió \"no lo sé\"");
        assert_eq!(out, "La Señora Pérez respondió \"no lo sé.\"");
    }

    #[test]
    fn test_heading_lines_untouched() {
        let rules = HeadingRules::new(Language::En, Some("###".to_string()));
        let p = TextPreprocessor::new(Language::En, rules);
        assert_eq!(p.preprocess("### Part one\nBody"), "### Part one\nBody.");
    }

    #[test]
    fn test_only_punctuation() {
        assert!(is_only_punctuation("... - !"));
        assert!(is_only_punctuation(""));
        assert!(!is_only_punctuation("¿Sí?"));
        assert!(!is_only_punctuation("42."));
    }

    #[test]
    fn test_idempotent_on_samples() {
        let samples = [
            "\"Unclosed dialogue. And more",
            "Capítulo 3: El fin\n\"Hola\"? dijo. \"Adiós\"!!",
            "line one\nline two \"quoted\nline three\n\n\n\nCHAPTER TWO\n...",
            "He said: \"\n\"\"\n*** \n\"a\". \"b\"?!",
            "The Dr. arrived at 10:45.... Then \u{2014} silence\u{2026}",
        ];
        for lang in [Language::En, Language::Es] {
            let p = pre(lang);
            for sample in samples {
                let once = p.preprocess(sample);
                assert_eq!(p.preprocess(&once), once, "sample: {:?}", sample);
            }
        }
    }

    #[test]
    fn test_markup_around_heading_shaped_lines() {
        let p = pre(Language::Es);
        let once = p.preprocess("**1) Ejemplos:**\nTexto \"uno");
        assert_eq!(once, "**1) Ejemplos:**\nTexto \"uno.\"");
        assert_eq!(p.preprocess(&once), once);

        let p = pre(Language::En);
        for text in ["#3) 3B\".3a,!*\"E?c\"1):\nCC", "Chapter 2\"\nx \"y", "**NOTA:**\nABC \".\nok"] {
            let once = p.preprocess(text);
            assert_eq!(p.preprocess(&once), once, "text: {:?}", text);
        }
    }

    fn random_text(rng: &mut StdRng, tokens: &[&str], max_tokens: usize) -> String {
        let len = rng.random_range(0..max_tokens);
        (0..len).map(|_| tokens[rng.random_range(0..tokens.len())]).collect()
    }

    #[test]
    fn test_idempotent_on_random_text() {
        let narrow: Vec<String> = "aB c.\"\n\n,!?:3 *Dr\u{201C}\u{2026}-".chars().map(String::from).collect();
        let wide: Vec<String> = "aBCDE c.\"\n\n,!?:31 *#'Dr)".chars().map(String::from).collect();
        let words = [
            "ABC", "Chapter 2", " \"", "\"", "\n", "\n\n", ".", ";", "!", "x", "1) ", "*", "Dr. ", "3:30", " ",
            "#", "NOTA:", "**",
        ];
        let mut rng = StdRng::seed_from_u64(42);
        for lang in [Language::En, Language::Es] {
            let p = pre(lang);
            for tokens in [&narrow, &wide] {
                let tokens: Vec<&str> = tokens.iter().map(String::as_str).collect();
                for _ in 0..1500 {
                    let text = random_text(&mut rng, &tokens, 60);
                    let once = p.preprocess(&text);
                    assert_eq!(p.preprocess(&once), once, "text: {:?}", text);
                }
            }
            for _ in 0..1500 {
                let text = random_text(&mut rng, &words, 25);
                let once = p.preprocess(&text);
                assert_eq!(p.preprocess(&once), once, "text: {:?}", text);
            }
        }
    }
}
