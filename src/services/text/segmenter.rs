use regex::Regex;
use std::sync::LazyLock;

use crate::core::state::{ChapterSpans, SpanKind, TextSpan};
use crate::services::language::Language;

const EN_LABELS: &str = "chapter|part|section|act|book|prologue|epilogue";
const ES_LABELS: &str = "cap[ií]tulo|parte|secci[oó]n|acto|libro|pr[oó]logo|ep[ií]logo";
const EN_NUMBERS: &str = "one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve|\
thirteen|fourteen|fifteen|sixteen|seventeen|eighteen|nineteen|twenty|first|second|third|last|final";
const ES_NUMBERS: &str = "uno|dos|tres|cuatro|cinco|seis|siete|ocho|nueve|diez|once|doce|\
trece|catorce|quince|dieciséis|dieciseis|diecisiete|dieciocho|diecinueve|veinte|primero|\
segundo|tercero|último|ultimo|final";

fn labelled_heading(labels: &str, numbers: &str) -> Regex {
    // Label, then a number, then nothing or a separator and a title.
    // "Capítulo uno era interesante" has no separator after the number.
    let pattern = format!(
        r"(?i)^(?:{labels})(?:\s+(?:\d{{1,4}}|[ivxlcdm]{{1,7}}|{numbers}))?\s*(?:[:.\-]\s*\S.*|[:.\-])?$",
        labels = labels,
        numbers = numbers,
    );
    Regex::new(&pattern).unwrap()
}

static HEADING_EN: LazyLock<Regex> = LazyLock::new(|| labelled_heading(EN_LABELS, EN_NUMBERS));
static HEADING_ES: LazyLock<Regex> = LazyLock::new(|| labelled_heading(ES_LABELS, ES_NUMBERS));
static NUMBERED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}[.)]\s+\S").unwrap());

/// Heuristics that mark a line as a structural chapter boundary.
#[derive(Debug, Clone, Default)]
pub struct HeadingRules {
    /// `None` accepts the labels of every supported language.
    language: Option<Language>,
    marker: Option<String>,
}

impl HeadingRules {
    pub fn new(language: Language, marker: Option<String>) -> Self {
        Self {
            language: Some(language),
            marker: marker.filter(|m| !m.trim().is_empty()),
        }
    }

    pub fn is_heading(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || line.chars().count() > 120 {
            return false;
        }
        if let Some(marker) = &self.marker {
            if line.starts_with(marker.as_str()) {
                return true;
            }
        }
        let labelled = match self.language {
            Some(Language::En) => HEADING_EN.is_match(line),
            Some(Language::Es) => HEADING_ES.is_match(line) || HEADING_EN.is_match(line),
            None => HEADING_ES.is_match(line) || HEADING_EN.is_match(line),
        };
        labelled || is_numbered_title(line) || is_all_caps_title(line)
    }
}

/// "1. Introduction" style lines: short, and not a sentence.
fn is_numbered_title(line: &str) -> bool {
    NUMBERED_LINE.is_match(line)
        && line.split_whitespace().count() <= 10
        && !line.ends_with(['.', '!', '?', ',', ';', '"'])
}

fn is_all_caps_title(line: &str) -> bool {
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() >= 3
        && letters.iter().all(|c| !c.is_lowercase())
        && line.split_whitespace().count() <= 8
        && !line.contains('"')
        && !line.ends_with(['!', '?'])
}

/// Heading check with the labels of every supported language.
pub fn check_if_chapter_heading(line: &str) -> bool {
    HeadingRules::default().is_heading(line)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedChapter {
    /// Heading line, or empty for text that precedes the first heading.
    pub title: String,
    pub body: String,
}

pub struct TextSegmenter {
    rules: HeadingRules,
    narrator_voice: String,
    dialogue_voice: String,
}

impl TextSegmenter {
    pub fn new(rules: HeadingRules, narrator_voice: impl Into<String>, dialogue_voice: impl Into<String>) -> Self {
        Self {
            rules,
            narrator_voice: narrator_voice.into(),
            dialogue_voice: dialogue_voice.into(),
        }
    }

    /// Splits text at heading lines. Non-empty text before the first heading
    /// becomes an untitled introduction.
    pub fn detect_chapters(&self, text: &str) -> Vec<DetectedChapter> {
        let mut chapters = Vec::new();
        let mut title = String::new();
        let mut body: Vec<&str> = Vec::new();

        for line in text.lines() {
            if self.rules.is_heading(line) {
                push_chapter(&mut chapters, std::mem::take(&mut title), &body);
                body.clear();
                title = line.trim().to_string();
            } else {
                body.push(line);
            }
        }
        push_chapter(&mut chapters, title, &body);
        chapters
    }

    /// Ordered narration/dialogue spans of one chapter body. Heading lines
    /// are dropped. Never fails; malformed quoting degrades to narration.
    pub fn segment(&self, text: &str) -> Vec<TextSpan> {
        let mut spans = Vec::new();
        for paragraph in paragraphs(text, &self.rules) {
            let mut units: Vec<(SpanKind, String)> = Vec::new();
            for (kind, unit) in split_units(&paragraph) {
                let unit = unit.trim();
                if unit.is_empty() {
                    continue;
                }
                match units.last_mut() {
                    Some((last_kind, content)) if *last_kind == kind => {
                        content.push(' ');
                        content.push_str(unit);
                    }
                    _ => units.push((kind, unit.to_string())),
                }
            }
            spans.extend(units.into_iter().map(|(kind, content)| TextSpan {
                voice_id: match kind {
                    SpanKind::Narration => self.narrator_voice.clone(),
                    SpanKind::Dialogue => self.dialogue_voice.clone(),
                },
                content,
                kind,
            }));
        }
        spans
    }

    pub fn segment_chapters(&self, text: &str) -> Vec<ChapterSpans> {
        self.detect_chapters(text)
            .into_iter()
            .map(|chapter| ChapterSpans {
                spans: self.segment(&chapter.body),
                title: chapter.title,
            })
            .filter(|c| !c.spans.is_empty())
            .collect()
    }
}

fn push_chapter(chapters: &mut Vec<DetectedChapter>, title: String, body: &[&str]) {
    let body = body.join("\n").trim().to_string();
    if !body.is_empty() || !title.is_empty() {
        chapters.push(DetectedChapter { title, body });
    }
}

/// Blank-line separated paragraphs with their lines joined by spaces.
fn paragraphs(text: &str, rules: &HeadingRules) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                out.push(current.join(" "));
                current.clear();
            }
        } else if rules.is_heading(line) {
            if !current.is_empty() {
                out.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(current.join(" "));
    }
    out
}

/// Quote-delimited units of a paragraph. A matched `"..."` pair with text
/// inside is dialogue; an opening quote that never closes turns the rest of
/// the paragraph into narration.
fn split_units(paragraph: &str) -> Vec<(SpanKind, &str)> {
    let mut units = Vec::new();
    let mut rest = paragraph;
    while let Some(open) = rest.find('"') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('"') else {
            break;
        };
        let quoted = &rest[open..open + close + 2];
        units.push((SpanKind::Narration, &rest[..open]));
        if after[..close].trim().is_empty() {
            units.push((SpanKind::Narration, quoted));
        } else {
            units.push((SpanKind::Dialogue, quoted));
        }
        rest = &after[close + 1..];
    }
    units.push((SpanKind::Narration, rest));
    units
}
