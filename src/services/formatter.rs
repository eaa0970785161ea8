use crate::core::state::ApprovedChapter;
use crate::services::language::Language;
use crate::services::text::segmenter::HeadingRules;

const MAX_LINE_LENGTH: usize = 100;

/// Lays approved chapters out as plain audiobook text: a `Chapter N`
/// heading, the title, a blank line, then the body wrapped into short
/// sentence-aligned lines with a blank line between paragraphs.
pub struct ContentFormatter {
    language: Language,
    rules: HeadingRules,
    max_line_length: usize,
}

impl ContentFormatter {
    pub fn new(language: Language, rules: HeadingRules) -> Self {
        Self {
            language,
            rules,
            max_line_length: MAX_LINE_LENGTH,
        }
    }

    pub fn format(&self, chapters: &[ApprovedChapter]) -> String {
        let mut ordered: Vec<&ApprovedChapter> = chapters.iter().collect();
        ordered.sort_by_key(|c| c.spec.number);
        ordered
            .iter()
            .map(|c| self.format_chapter(c))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn format_chapter(&self, chapter: &ApprovedChapter) -> String {
        let mut lines = vec![format!(
            "{} {}",
            self.language.chapter_prefix(),
            chapter.spec.number
        )];
        let title = chapter.spec.title.trim();
        if !title.is_empty() {
            lines.push(title.to_string());
        }

        let body = self.strip_leading_heading(&chapter.draft.text);
        for paragraph in body.split("\n\n") {
            let wrapped = self.split_paragraph(paragraph);
            if !wrapped.is_empty() {
                lines.push(String::new());
                lines.extend(wrapped);
            }
        }
        lines.join("\n")
    }

    /// Drafts often repeat the chapter heading on their first line.
    fn strip_leading_heading<'a>(&self, text: &'a str) -> &'a str {
        let text = text.trim_start();
        match text.split_once('\n') {
            Some((first, rest)) if self.rules.is_heading(first) => rest,
            None if self.rules.is_heading(text) => "",
            _ => text,
        }
    }

    /// Splits on ". ", closes each sentence with punctuation and packs
    /// sentences into lines of at most `max_line_length` characters. A
    /// single longer sentence keeps a line of its own.
    pub fn split_paragraph(&self, paragraph: &str) -> Vec<String> {
        let joined = paragraph.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut lines = Vec::new();
        let mut current = String::new();

        for sentence in joined.split(". ") {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            let mut sentence = sentence.to_string();
            if !sentence.ends_with(['.', '!', '?']) {
                sentence.push('.');
            }
            let len = |s: &str| s.chars().count();
            if !current.is_empty() && len(&current) + len(&sentence) + 1 > self.max_line_length {
                lines.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&sentence);
        }
        if !current.is_empty() {
            lines.push(current);
        }
        lines
    }
}
