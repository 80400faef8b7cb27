use serde::Serialize;
use whatlang::Lang;

/// Outcome of mapping a text blob onto the configured language set.
#[derive(Debug, Clone, Serialize)]
pub struct LanguageDetection {
	/// The language the rest of the pipeline uses; always a member of the
	/// configured set.
	pub language: String,
	/// What the detector actually saw, before the supported-set check.
	pub detected_language: Option<String>,
	pub used_fallback: bool,
	pub confidence: f64,
}

/// ISO 639-1 style identifier for a detected language. Norwegian maps to
/// `nb`, the code the analyzer's recognizers are registered under.
fn iso_code(lang: Lang) -> Option<&'static str> {
	let code = match lang {
		Lang::Eng => "en",
		Lang::Deu => "de",
		Lang::Fra => "fr",
		Lang::Spa => "es",
		Lang::Ita => "it",
		Lang::Por => "pt",
		Lang::Nld => "nl",
		Lang::Pol => "pl",
		Lang::Rus => "ru",
		Lang::Ukr => "uk",
		Lang::Jpn => "ja",
		Lang::Kor => "ko",
		Lang::Cmn => "zh",
		Lang::Ara => "ar",
		Lang::Hin => "hi",
		Lang::Tur => "tr",
		Lang::Swe => "sv",
		Lang::Nob => "nb",
		Lang::Dan => "da",
		Lang::Fin => "fi",
		Lang::Ces => "cs",
		Lang::Ron => "ro",
		Lang::Ell => "el",
		Lang::Heb => "he",
		Lang::Hun => "hu",
		Lang::Vie => "vi",
		Lang::Ind => "id",
		Lang::Tha => "th",
		Lang::Bul => "bg",
		Lang::Hrv => "hr",
		Lang::Slk => "sk",
		Lang::Slv => "sl",
		Lang::Lit => "lt",
		Lang::Lav => "lv",
		Lang::Est => "et",
		_ => return None,
	};
	Some(code)
}

/// Detect the language of `text` and clamp it to the supported set.
///
/// Empty input skips detection entirely and yields the fallback without
/// marking it as such. A detected language outside the supported set (or an
/// undecidable text) yields the fallback with `used_fallback` set.
pub fn detect_language(text: &str, supported: &[String], fallback: &str) -> LanguageDetection {
	if text.trim().is_empty() {
		return LanguageDetection {
			language: fallback.to_string(),
			detected_language: None,
			used_fallback: false,
			confidence: 0.0,
		};
	}

	let info = whatlang::detect(text);
	let confidence = info.as_ref().map(|i| i.confidence()).unwrap_or(0.0);
	let detected = info.and_then(|i| iso_code(i.lang()));

	match detected {
		Some(code) if supported.iter().any(|s| s == code) => LanguageDetection {
			language: code.to_string(),
			detected_language: Some(code.to_string()),
			used_fallback: false,
			confidence,
		},
		other => LanguageDetection {
			language: fallback.to_string(),
			detected_language: other.map(|c| c.to_string()),
			used_fallback: true,
			confidence,
		},
	}
}
