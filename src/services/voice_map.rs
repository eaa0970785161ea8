use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::core::error::ConfigError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    #[default]
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceRole {
    Narrator,
    Dialogue,
}

/// Either a discrete gender, or a character placed on the 0-10
/// masculine-feminine axis. Score maps are chosen by the narrator's gender.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VoiceQuery {
    Gender(Gender),
    Character { narrator: Gender, score: f64 },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEngine {
    #[serde(default)]
    narrator: HashMap<Gender, String>,
    #[serde(default)]
    dialogue: HashMap<Gender, String>,
    #[serde(default)]
    score_map: HashMap<Gender, BTreeMap<String, String>>,
    default_voice: String,
}

#[derive(Debug, Clone)]
struct EngineVoices {
    narrator: HashMap<Gender, String>,
    dialogue: HashMap<Gender, String>,
    /// Breakpoints sorted ascending.
    score_map: HashMap<Gender, Vec<(f64, String)>>,
    default_voice: String,
}

impl EngineVoices {
    fn from_raw(engine: &str, raw: RawEngine) -> Result<Self, ConfigError> {
        let mut score_map = HashMap::new();
        for (gender, table) in raw.score_map {
            let mut points = Vec::with_capacity(table.len());
            for (key, voice) in table {
                let score: f64 = key.trim().parse().map_err(|_| {
                    ConfigError::new(format!("{}: score breakpoint {:?} is not a number", engine, key))
                })?;
                if !(0.0..=10.0).contains(&score) {
                    return Err(ConfigError::new(format!(
                        "{}: score breakpoint {} outside 0-10",
                        engine, score
                    )));
                }
                points.push((score, voice));
            }
            points.sort_by(|a, b| a.0.total_cmp(&b.0));
            score_map.insert(gender, points);
        }
        if raw.default_voice.trim().is_empty() {
            return Err(ConfigError::new(format!("{}: default_voice is empty", engine)));
        }
        Ok(Self {
            narrator: raw.narrator,
            dialogue: raw.dialogue,
            score_map,
            default_voice: raw.default_voice,
        })
    }

    fn by_score(&self, narrator: Gender, score: f64) -> Option<&str> {
        let points = self.score_map.get(&narrator).filter(|p| !p.is_empty())?;
        let below = points.iter().rev().find(|(bp, _)| *bp <= score);
        // Below every breakpoint: the closest one is the lowest.
        let (_, voice) = below.unwrap_or(&points[0]);
        Some(voice.as_str())
    }
}

/// Engine → role → gender/score → voice id. Read-only once loaded.
#[derive(Debug, Clone)]
pub struct VoiceMap {
    engines: HashMap<String, EngineVoices>,
}

impl VoiceMap {
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let raw: HashMap<String, RawEngine> = serde_json::from_str(content)
            .map_err(|e| ConfigError::new(format!("invalid voice map: {}", e)))?;
        let mut engines = HashMap::new();
        for (name, engine) in raw {
            let voices = EngineVoices::from_raw(&name, engine)?;
            engines.insert(name, voices);
        }
        Ok(Self { engines })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new(format!("cannot read voice map {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Kokoro and Orpheus tables shipped with the binary.
    pub fn builtin() -> Self {
        let mut engines = HashMap::new();
        engines.insert(
            "kokoro".to_string(),
            table(
                ("am_puck", "af_heart"),
                ("af_alloy+am_puck", "af_sky"),
                [
                    "am_puck", "am_onyx", "am_michael", "am_echo", "am_fenrir+bf_alice",
                    "af_alloy+am_puck", "af_kore", "af_sky", "af_aoede+af_heart", "af_sarah",
                    "af_bella",
                ],
                [
                    "af_heart", "am_onyx", "am_echo", "am_puck", "am_fenrir+bf_alice",
                    "af_alloy+am_puck", "af_kore", "af_sky", "af_aoede+af_heart", "af_sarah",
                    "af_bella",
                ],
                "af_heart",
            ),
        );
        engines.insert(
            "orpheus".to_string(),
            table(
                ("zac", "tara"),
                ("dan", "leah"),
                [
                    "zac", "leo", "dan", "dan", "zac", "zoe", "jess", "tara", "tara", "leah", "mia",
                ],
                [
                    "tara", "leo", "dan", "zac", "zac", "zoe", "jess", "jess", "leah", "leah", "mia",
                ],
                "tara",
            ),
        );
        Self { engines }
    }

    pub fn has_engine(&self, engine: &str) -> bool {
        self.engines.contains_key(engine)
    }

    pub fn resolve(
        &self,
        engine: &str,
        role: VoiceRole,
        query: VoiceQuery,
    ) -> Result<String, ConfigError> {
        let voices = self
            .engines
            .get(engine)
            .ok_or_else(|| ConfigError::new(format!("engine {:?} missing from voice map", engine)))?;

        let found = match (role, query) {
            (VoiceRole::Narrator, VoiceQuery::Gender(g)) => voices.narrator.get(&g).map(String::as_str),
            (VoiceRole::Dialogue, VoiceQuery::Gender(g)) => voices.dialogue.get(&g).map(String::as_str),
            // The narrator sits at the bottom of its own score map.
            (VoiceRole::Narrator, VoiceQuery::Character { narrator, .. }) => voices
                .score_map
                .get(&narrator)
                .and_then(|p| p.first())
                .map(|(_, v)| v.as_str()),
            (VoiceRole::Dialogue, VoiceQuery::Character { narrator, score }) => {
                voices.by_score(narrator, score)
            }
        };
        Ok(found.unwrap_or(&voices.default_voice).to_string())
    }

    /// Narrator and dialogue voices for a book read by `narrator`.
    pub fn voices_for(&self, engine: &str, narrator: Gender) -> Result<(String, String), ConfigError> {
        Ok((
            self.resolve(engine, VoiceRole::Narrator, VoiceQuery::Gender(narrator))?,
            self.resolve(engine, VoiceRole::Dialogue, VoiceQuery::Gender(narrator))?,
        ))
    }
}

fn table(
    narrator: (&str, &str),
    dialogue: (&str, &str),
    male_scores: [&str; 11],
    female_scores: [&str; 11],
    default_voice: &str,
) -> EngineVoices {
    let by_gender = |(male, female): (&str, &str)| {
        HashMap::from([
            (Gender::Male, male.to_string()),
            (Gender::Female, female.to_string()),
        ])
    };
    let points = |voices: [&str; 11]| {
        voices
            .iter()
            .enumerate()
            .map(|(i, v)| (i as f64, v.to_string()))
            .collect::<Vec<_>>()
    };
    EngineVoices {
        narrator: by_gender(narrator),
        dialogue: by_gender(dialogue),
        score_map: HashMap::from([
            (Gender::Male, points(male_scores)),
            (Gender::Female, points(female_scores)),
        ]),
        default_voice: default_voice.to_string(),
    }
}
