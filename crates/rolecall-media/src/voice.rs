//! Voice inventory and the role-driven voice-selection policy.

use serde::{Deserialize, Serialize};

use rolecall_core::types::{VoiceGender, VoiceProfile};

/// A voice offered by the speech synthesizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    pub name: String,
    /// BCP 47 tag, e.g. `en-GB`.
    pub lang: String,
    pub gender: Option<VoiceGender>,
    /// The platform's default voice.
    #[serde(default)]
    pub default: bool,
}

impl Voice {
    /// Build a voice, inferring its gender from the name.
    pub fn new(name: impl Into<String>, lang: impl Into<String>) -> Self {
        let name = name.into();
        let gender = infer_gender(&name);
        Self {
            name,
            lang: lang.into(),
            gender,
            default: false,
        }
    }

    pub fn with_default(mut self, default: bool) -> Self {
        self.default = default;
        self
    }
}

/// Platforms rarely tag voices with a gender; the name is the only hint.
pub fn infer_gender(name: &str) -> Option<VoiceGender> {
    let lower = name.to_lowercase();
    // "female" contains "male"
    if lower.contains("female") {
        Some(VoiceGender::Female)
    } else if lower.contains("male") {
        Some(VoiceGender::Male)
    } else {
        None
    }
}

/// Whether `voice_lang` falls under the wanted tag (`en` matches `en-GB`).
fn lang_matches(voice_lang: &str, wanted: &str) -> bool {
    let voice = voice_lang.replace('_', "-").to_lowercase();
    let wanted = wanted.replace('_', "-").to_lowercase();
    if wanted.is_empty() {
        return false;
    }
    voice == wanted || voice.starts_with(&format!("{wanted}-"))
}

/// Pick a voice for a role:
///
/// 1. the first preferred language with a voice of the declared gender;
/// 2. the first preferred language with any voice;
/// 3. the platform default (or the first voice).
pub fn select_voice<'a>(voices: &'a [Voice], profile: &VoiceProfile) -> Option<&'a Voice> {
    if let Some(gender) = profile.gender {
        for lang in &profile.preferred_languages {
            if let Some(voice) = voices
                .iter()
                .find(|v| lang_matches(&v.lang, lang) && v.gender == Some(gender))
            {
                return Some(voice);
            }
        }
    }

    for lang in &profile.preferred_languages {
        if let Some(voice) = voices.iter().find(|v| lang_matches(&v.lang, lang)) {
            return Some(voice);
        }
    }

    voices.iter().find(|v| v.default).or_else(|| voices.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> Vec<Voice> {
        vec![
            Voice::new("Google US English Female", "en-US").with_default(true),
            Voice::new("Daniel", "en-GB"),
            Voice::new("Microsoft George Male", "en-GB"),
            Voice::new("Ting-Ting Female", "zh-CN"),
        ]
    }

    fn profile(langs: &[&str], gender: Option<VoiceGender>) -> VoiceProfile {
        VoiceProfile {
            preferred_languages: langs.iter().map(|s| s.to_string()).collect(),
            gender,
            ..Default::default()
        }
    }

    #[test]
    fn test_infer_gender() {
        assert_eq!(infer_gender("Samantha Female"), Some(VoiceGender::Female));
        assert_eq!(infer_gender("Alex (Male)"), Some(VoiceGender::Male));
        assert_eq!(infer_gender("Daniel"), None);
    }

    #[test]
    fn test_language_and_gender_match_wins() {
        let voices = inventory();
        let chosen = select_voice(&voices, &profile(&["en-GB"], Some(VoiceGender::Male))).unwrap();
        assert_eq!(chosen.name, "Microsoft George Male");
    }

    #[test]
    fn test_gender_match_in_later_language_beats_language_only() {
        let voices = inventory();
        let chosen =
            select_voice(&voices, &profile(&["en-GB", "zh"], Some(VoiceGender::Female))).unwrap();
        assert_eq!(chosen.name, "Ting-Ting Female");
    }

    #[test]
    fn test_language_only_fallback() {
        let voices = inventory();
        let chosen = select_voice(&voices, &profile(&["en-GB"], Some(VoiceGender::Female))).unwrap();
        assert_eq!(chosen.name, "Daniel");
    }

    #[test]
    fn test_prefix_language_match() {
        let voices = inventory();
        let chosen = select_voice(&voices, &profile(&["zh"], None)).unwrap();
        assert_eq!(chosen.lang, "zh-CN");
    }

    #[test]
    fn test_platform_default_fallback() {
        let voices = inventory();
        let chosen = select_voice(&voices, &profile(&["el"], Some(VoiceGender::Male))).unwrap();
        assert_eq!(chosen.name, "Google US English Female");

        let no_default: Vec<Voice> = voices.into_iter().map(|v| v.with_default(false)).collect();
        let chosen = select_voice(&no_default, &profile(&[], None)).unwrap();
        assert_eq!(chosen.name, "Google US English Female");
    }

    #[test]
    fn test_empty_inventory() {
        assert!(select_voice(&[], &profile(&["en"], None)).is_none());
    }
}
