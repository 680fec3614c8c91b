//! Transcript post-processing.
//!
//! Engines annotate their output with `<|tag|>` tokens (language, emotion, event
//! markers). A small tokenizer splits the raw text into plain text and tags; the
//! first tag that names a known language becomes the result language.

/// Opening and closing delimiters of an annotation token.
const TAG_OPEN: &str = "<|";
const TAG_CLOSE: &str = "|>";

/// Used when the engine does not report its own confidence.
pub const DEFAULT_CONFIDENCE: f32 = 0.8;

/// Language tags the gateway recognizes, with display names.
const LANGUAGES: &[(&str, &str)] = &[
    ("zh", "Chinese"),
    ("en", "English"),
    ("yue", "Cantonese"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("nospeech", "No speech"),
    ("auto", "Auto-detect"),
];

pub const UNKNOWN_LANGUAGE: &str = "unknown";
pub const UNKNOWN_LANGUAGE_NAME: &str = "Unknown";

/// Plain transcript plus everything pulled out of it.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotated {
    pub text: String,
    pub tags: Vec<String>,
    pub language: String,
    pub language_name: String,
}

/// Display name for a language code, if the code is known.
pub fn language_name(code: &str) -> Option<&'static str> {
    let code = code.to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|(tag, _)| *tag == code)
        .map(|(_, name)| *name)
}

/// Split `raw` into text and tags.
///
/// Text between tags is concatenated as-is and the result trimmed. An opening
/// delimiter with no matching close is kept as literal text.
fn tokenize(raw: &str) -> (String, Vec<String>) {
    let mut text = String::with_capacity(raw.len());
    let mut tags = Vec::new();
    let mut rest = raw;

    while let Some(start) = rest.find(TAG_OPEN) {
        let after_open = &rest[start + TAG_OPEN.len()..];
        match after_open.find(TAG_CLOSE) {
            Some(end) => {
                text.push_str(&rest[..start]);
                tags.push(after_open[..end].trim().to_string());
                rest = &after_open[end + TAG_CLOSE.len()..];
            }
            None => break,
        }
    }
    text.push_str(rest);

    (text.trim().to_string(), tags)
}

pub fn parse(raw: &str) -> Annotated {
    let (text, tags) = tokenize(raw);

    let (language, language_name) = tags
        .iter()
        .find_map(|tag| language_name(tag).map(|name| (tag.to_ascii_lowercase(), name.to_string())))
        .unwrap_or_else(|| (UNKNOWN_LANGUAGE.to_string(), UNKNOWN_LANGUAGE_NAME.to_string()));

    Annotated {
        text,
        tags,
        language,
        language_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_tags_and_extracts_language() {
        let parsed = parse("<|zh|><|NEUTRAL|><|Speech|><|woitn|>今天天气很好");
        assert_eq!(parsed.text, "今天天气很好");
        assert_eq!(parsed.language, "zh");
        assert_eq!(parsed.language_name, "Chinese");
        assert_eq!(parsed.tags, vec!["zh", "NEUTRAL", "Speech", "woitn"]);
    }

    #[test]
    fn test_first_language_tag_wins() {
        let parsed = parse("<|HAPPY|><|EN|> hello <|ja|>");
        assert_eq!(parsed.text, "hello");
        assert_eq!(parsed.language, "en");
        assert_eq!(parsed.language_name, "English");
    }

    #[test]
    fn test_no_tags() {
        let parsed = parse("  plain text  ");
        assert_eq!(parsed.text, "plain text");
        assert!(parsed.tags.is_empty());
        assert_eq!(parsed.language, UNKNOWN_LANGUAGE);
        assert_eq!(parsed.language_name, UNKNOWN_LANGUAGE_NAME);
    }

    #[test]
    fn test_unterminated_delimiter_is_literal() {
        let parsed = parse("<|yue|>a <| b");
        assert_eq!(parsed.text, "a <| b");
        assert_eq!(parsed.language, "yue");
        assert_eq!(parsed.language_name, "Cantonese");
    }

    #[test]
    fn test_tags_only() {
        let parsed = parse("<|nospeech|><|EMO_UNKNOWN|>");
        assert_eq!(parsed.text, "");
        assert_eq!(parsed.language_name, "No speech");
    }

    #[test]
    fn test_language_names() {
        assert_eq!(language_name("ko"), Some("Korean"));
        assert_eq!(language_name("AUTO"), Some("Auto-detect"));
        assert_eq!(language_name("fr"), None);
    }
}
