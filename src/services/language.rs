use serde::{Deserialize, Serialize};

use crate::core::state::ChapterSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    Es,
    En,
}

impl Language {
    /// Unknown tags fall back to Spanish.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "en" | "en-us" | "en-gb" | "english" => Language::En,
            _ => Language::Es,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Language::Es => "es",
            Language::En => "en",
        }
    }

    pub fn chapter_prefix(&self) -> &'static str {
        match self {
            Language::Es => "Capítulo",
            Language::En => "Chapter",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudiobookSize {
    Short,
    #[default]
    Medium,
    Long,
}

pub struct SizePreset {
    pub chapters_min: u32,
    pub chapters_max: u32,
    pub words_per_chapter: u32,
    pub total_words: u32,
    pub duration: &'static str,
}

impl AudiobookSize {
    pub fn preset(&self) -> SizePreset {
        match self {
            AudiobookSize::Short => SizePreset {
                chapters_min: 3,
                chapters_max: 4,
                words_per_chapter: 1200,
                total_words: 5000,
                duration: "30-40",
            },
            AudiobookSize::Medium => SizePreset {
                chapters_min: 5,
                chapters_max: 7,
                words_per_chapter: 1500,
                total_words: 10000,
                duration: "60-80",
            },
            AudiobookSize::Long => SizePreset {
                chapters_min: 8,
                chapters_max: 12,
                words_per_chapter: 2000,
                total_words: 20000,
                duration: "120-180",
            },
        }
    }
}

pub fn planner_system_prompt(lang: Language) -> &'static str {
    match lang {
        Language::Es => {
            "Eres un arquitecto de contenido educativo con amplia experiencia diseñando \
audiolibros de no ficción. Estructuras el contenido de lo simple a lo complejo, \
empiezas cada capítulo con un gancho y lo cierras con una idea memorable.\n\
Responde SIEMPRE en español, usa \"Capítulo\" y nunca \"Chapter\", y devuelve JSON válido."
        }
        Language::En => {
            "You are an educational content architect with long experience designing \
non-fiction audiobooks. You structure content from simple to complex, open every \
chapter with a hook and close it with a memorable insight.\n\
Always respond in English and return valid JSON."
        }
    }
}

pub fn generator_system_prompt(lang: Language) -> &'static str {
    match lang {
        Language::Es => {
            "Eres un escritor profesional de audiolibros educativos en español. Escribes \
con voz conversacional, párrafos cortos de tres a cinco oraciones, ejemplos concretos \
y transiciones suaves.\n\
Prohibido: palabras en inglés (Chapter, Part, Section), referencias visuales, listas \
con viñetas y párrafos de más de 100 palabras."
        }
        Language::En => {
            "You are a professional writer of educational audiobooks. You write in a \
conversational voice, in short paragraphs of three to five sentences, with concrete \
examples and smooth transitions.\n\
Forbidden: visual references, bulleted lists, unexplained jargon and paragraphs over \
100 words."
        }
    }
}

pub fn evaluator_system_prompt(lang: Language) -> &'static str {
    match lang {
        Language::Es => {
            "Eres un editor senior de audiolibros educativos. Puntúas de 0 a 100: \
claridad auditiva (25), estructura narrativa (25), cobertura del tema (25), \
engagement (15) y calidad de escritura (10).\n\
Responde SIEMPRE en español con JSON válido."
        }
        Language::En => {
            "You are a senior editor of educational audiobooks. You score from 0 to 100: \
auditory clarity (25), narrative structure (25), topic coverage (25), engagement (15) \
and writing quality (10).\n\
Always respond in English with valid JSON."
        }
    }
}

pub fn planning_prompt(lang: Language, topic: &str, size: AudiobookSize) -> String {
    let p = size.preset();
    match lang {
        Language::Es => format!(
            "## TAREA: Diseñar la estructura de un audiolibro\n\n\
**TEMA:** {topic}\n\n\
- Número de capítulos: {min}-{max}\n\
- Palabras por capítulo: ~{words}\n\
- Duración objetivo: {duration} minutos\n\n\
Responde SOLO con JSON de esta forma, sin texto antes ni después:\n\
{{\"chapters\": [{{\"number\": 1, \"title\": \"...\", \"summary\": \"...\", \
\"topics\": [\"...\"], \"estimated_length\": {words}}}], \
\"total_estimated_length\": {total}}}\n\
Cada capítulo debe tener de 3 a 5 temas concretos.",
            topic = topic,
            min = p.chapters_min,
            max = p.chapters_max,
            words = p.words_per_chapter,
            duration = p.duration,
            total = p.total_words,
        ),
        Language::En => format!(
            "## TASK: Design the structure of an audiobook\n\n\
**TOPIC:** {topic}\n\n\
- Number of chapters: {min}-{max}\n\
- Words per chapter: ~{words}\n\
- Target duration: {duration} minutes\n\n\
Respond ONLY with JSON shaped like this, with no text before or after:\n\
{{\"chapters\": [{{\"number\": 1, \"title\": \"...\", \"summary\": \"...\", \
\"topics\": [\"...\"], \"estimated_length\": {words}}}], \
\"total_estimated_length\": {total}}}\n\
Each chapter should have 3 to 5 specific topics.",
            topic = topic,
            min = p.chapters_min,
            max = p.chapters_max,
            words = p.words_per_chapter,
            duration = p.duration,
            total = p.total_words,
        ),
    }
}

pub fn chapter_prompt(
    lang: Language,
    topic: &str,
    spec: &ChapterSpec,
    feedback: Option<&str>,
) -> String {
    let topics: String = spec.topics.iter().map(|t| format!("- {}\n", t)).collect();
    let mut prompt = match lang {
        Language::Es => format!(
            "Escribe el contenido completo del Capítulo {}: {}\n\n\
Tema principal del audiolibro: {}\n\n\
Temas a cubrir en este capítulo:\n{}\n\
Longitud estimada: aproximadamente {} palabras.\n\
Debe entenderse bien al escucharse, con párrafos cortos y sin referencias visuales. \
No repitas el título. Al final, en una línea aparte, escribe \"Confidence: NN\" \
con tu confianza de 0 a 100 en la calidad del texto.",
            spec.number, spec.title, topic, topics, spec.target_length
        ),
        Language::En => format!(
            "Write the complete content for Chapter {}: {}\n\n\
Main topic of the audiobook: {}\n\n\
Topics to cover in this chapter:\n{}\n\
Estimated length: approximately {} words.\n\
It must be easy to follow when listened to, with short paragraphs and no visual \
references. Do not repeat the title. At the end, on a line of its own, write \
\"Confidence: NN\" with your 0-100 confidence in the text.",
            spec.number, spec.title, topic, topics, spec.target_length
        ),
    };
    if !spec.summary.is_empty() {
        let label = match lang {
            Language::Es => "Resumen del capítulo",
            Language::En => "Chapter summary",
        };
        prompt.push_str(&format!("\n\n{}: {}", label, spec.summary));
    }
    if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
        let label = match lang {
            Language::Es => "Feedback del editor sobre la versión anterior",
            Language::En => "Editor feedback on the previous version",
        };
        prompt.push_str(&format!("\n\n{}:\n{}", label, feedback));
    }
    prompt
}

pub fn evaluation_prompt(lang: Language, spec: &ChapterSpec, text: &str) -> String {
    match lang {
        Language::Es => format!(
            "## EVALUACIÓN DEL CAPÍTULO {}: {}\n\n{}\n\n---\n\
Evalúa el capítulo y responde SOLO con JSON:\n\
{{\"overall_score\": 85, \"strengths\": [\"...\"], \"weaknesses\": [\"...\"], \
\"improvement_instructions\": \"cambios concretos si la nota es menor de 70\"}}",
            spec.number, spec.title, text
        ),
        Language::En => format!(
            "## EVALUATION OF CHAPTER {}: {}\n\n{}\n\n---\n\
Evaluate the chapter and respond ONLY with JSON:\n\
{{\"overall_score\": 85, \"strengths\": [\"...\"], \"weaknesses\": [\"...\"], \
\"improvement_instructions\": \"specific changes if the score is below 70\"}}",
            spec.number, spec.title, text
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ChapterSpec {
        ChapterSpec {
            number: 2,
            title: "Matter".to_string(),
            summary: String::new(),
            topics: vec!["atoms".to_string(), "void".to_string()],
            target_length: 1500,
        }
    }

    #[test]
    fn test_from_tag_falls_back_to_spanish() {
        assert_eq!(Language::from_tag("EN"), Language::En);
        assert_eq!(Language::from_tag("fr"), Language::Es);
        assert_eq!(Language::from_tag("es").chapter_prefix(), "Capítulo");
    }

    #[test]
    fn test_planning_prompt_uses_size_preset() {
        let prompt = planning_prompt(Language::En, "Stoicism", AudiobookSize::Short);
        assert!(prompt.contains("Stoicism"));
        assert!(prompt.contains("3-4"));
        assert!(prompt.contains("~1200"));
    }

    #[test]
    fn test_chapter_prompt_carries_feedback() {
        let plain = chapter_prompt(Language::En, "Materialism", &spec(), None);
        assert!(plain.contains("Chapter 2: Matter"));
        assert!(plain.contains("- atoms"));
        assert!(!plain.contains("Editor feedback"));

        let revised = chapter_prompt(Language::Es, "Materialismo", &spec(), Some("Más ejemplos"));
        assert!(revised.contains("Capítulo 2"));
        assert!(revised.contains("Más ejemplos"));
    }
}
