use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use smartvision_contracts::{DescriptionResult, KeywordPolicy, ParseError};

static LABELLED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[\s#>*_\-]*(title|description|keywords)[\s*_]*:[\s*_]*(.*)$").unwrap()
});
static HEADING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[\s#>*_\-]*(title|description|keywords)[\s*_:]*$").unwrap());
static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*+•]|\d+[.)])\s+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Description,
    Keywords,
}

impl Field {
    fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "title" => Some(Field::Title),
            "description" => Some(Field::Description),
            "keywords" => Some(Field::Keywords),
            _ => None,
        }
    }
}

/// Turns a raw description-service response into a validated [`DescriptionResult`].
///
/// Structured JSON content is preferred. Free text with labelled lines is accepted as a
/// fallback so that chatty answers still yield a result.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseParser {
    policy: KeywordPolicy,
}

impl ResponseParser {
    pub fn new(policy: KeywordPolicy) -> Self {
        Self { policy }
    }

    pub fn parse(&self, response: &Value) -> Result<DescriptionResult, ParseError> {
        if let Some(error) = response.get("error").filter(|value| !value.is_null()) {
            return Err(ParseError::ServiceError(service_error_message(error)));
        }
        if let Some(object) = response.as_object() {
            if lookup(object, "title").is_some() {
                return self.from_object(object);
            }
        }
        if let Some(text) = response.as_str() {
            return self.parse_text(text);
        }
        let text = assistant_text(response).ok_or(ParseError::NoStructure)?;
        self.parse_text(&text)
    }

    pub fn parse_text(&self, text: &str) -> Result<DescriptionResult, ParseError> {
        if let Some(object) = extract_json_object_from_text(text) {
            return self.from_object(&object);
        }
        self.from_labelled_lines(text)
    }

    fn from_object(&self, object: &Map<String, Value>) -> Result<DescriptionResult, ParseError> {
        let title = lookup(object, "title")
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingField("title"))?;
        let description = lookup(object, "description")
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingField("description"))?;
        let keywords = coerce_keywords(lookup(object, "keywords"));
        DescriptionResult::new(title, description, keywords, self.policy)
    }

    fn from_labelled_lines(&self, text: &str) -> Result<DescriptionResult, ParseError> {
        let mut title: Vec<String> = Vec::new();
        let mut description: Vec<String> = Vec::new();
        let mut keywords: Vec<String> = Vec::new();
        let mut current: Option<Field> = None;
        let mut found_label = false;

        for line in text.lines() {
            let (field, value) = if let Some(caps) = LABELLED_LINE.captures(line) {
                (
                    Field::from_label(&caps[1]),
                    caps.get(2).map(|found| found.as_str()).unwrap_or(""),
                )
            } else if let Some(caps) = HEADING_LINE.captures(line) {
                (Field::from_label(&caps[1]), "")
            } else {
                (None, line)
            };
            if field.is_some() {
                current = field;
                found_label = true;
            }
            let value = clean_value(&LIST_MARKER.replace(value, ""));
            if value.is_empty() {
                continue;
            }
            match current {
                Some(Field::Title) => title.push(value),
                Some(Field::Description) => description.push(value),
                Some(Field::Keywords) => keywords.extend(
                    value.split(',').map(clean_value).filter(|kw| !kw.is_empty()),
                ),
                None => {}
            }
        }

        if !found_label {
            return Err(ParseError::NoStructure);
        }
        let title = title.first().cloned().ok_or(ParseError::MissingField("title"))?;
        if description.is_empty() {
            return Err(ParseError::MissingField("description"));
        }
        DescriptionResult::new(&title, &description.join(" "), keywords, self.policy)
    }
}

/// Text of the first chat choice; string content or an array of text parts.
fn assistant_text(response: &Value) -> Option<String> {
    let content = response
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?;
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let joined = parts
                .iter()
                .filter_map(|part| {
                    part.get("text")
                        .and_then(Value::as_str)
                        .or_else(|| part.as_str())
                })
                .collect::<Vec<&str>>()
                .join("\n");
            Some(joined)
        }
        _ => None,
    }
}

fn service_error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn lookup<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    object
        .iter()
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn coerce_keywords(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(text)) => text.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn clean_value(raw: &str) -> String {
    raw.trim()
        .trim_matches(|ch: char| matches!(ch, '*' | '_' | '"' | '\'' | '`'))
        .trim()
        .to_string()
}

fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    if !(raw.starts_with("```") && raw.ends_with("```")) {
        return raw.to_string();
    }
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() < 2 {
        return raw.to_string();
    }
    let first = lines[0].trim_start_matches('`').trim();
    let mut body = lines[1..lines.len() - 1].join("\n").trim().to_string();
    if first.is_empty() && body.to_ascii_lowercase().starts_with("json") {
        body = body[4..].trim().to_string();
    }
    body
}

fn extract_json_object_from_text(text: &str) -> Option<Map<String, Value>> {
    let raw = strip_code_fence(text);
    if raw.trim().is_empty() {
        return None;
    }
    let mut candidates = vec![raw.clone()];
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            candidates.push(raw[start..=end].to_string());
        }
    }
    candidates.into_iter().find_map(|candidate| {
        serde_json::from_str::<Value>(&candidate)
            .ok()
            .and_then(|parsed| parsed.as_object().cloned())
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use smartvision_contracts::{KeywordPolicy, ParseError};

    use super::{extract_json_object_from_text, strip_code_fence, ResponseParser};

    fn chat(content: &str) -> serde_json::Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    #[test]
    fn parses_fenced_json_content() -> anyhow::Result<()> {
        let content = "```json\n{\"Title\": \"Sunset Vista\", \"description\": \"A glowing orange sky over rolling hills.\", \"keywords\": [\"sunset\", \"hills\", \"sky\", \"Sky\", \"\"]}\n```";
        let result = ResponseParser::default().parse(&chat(content))?;
        assert_eq!(result.title(), "Sunset Vista");
        assert_eq!(
            result.description(),
            "A glowing orange sky over rolling hills."
        );
        assert_eq!(result.keywords(), ["sunset", "hills", "sky"]);
        Ok(())
    }

    #[test]
    fn tolerates_prose_around_the_json_object() -> anyhow::Result<()> {
        let content = "Sure! Here is the metadata:\n{\"title\":\"Fog\",\"description\":\"Pines in fog.\",\"keywords\":\"fog, pines ,forest\"}\nHope this helps.";
        let result = ResponseParser::default().parse(&chat(content))?;
        assert_eq!(result.title(), "Fog");
        assert_eq!(result.keywords_joined(), "fog,pines,forest");
        Ok(())
    }

    #[test]
    fn falls_back_to_labelled_lines() -> anyhow::Result<()> {
        let content = "**Title:** \"Harbor at Dawn\"\n\n**Description:** Fishing boats rest\nin a calm harbor.\n\n### Keywords\n- harbor\n- boats, dawn\n- Harbor";
        let result = ResponseParser::default().parse(&chat(content))?;
        assert_eq!(result.title(), "Harbor at Dawn");
        assert_eq!(result.description(), "Fishing boats rest in a calm harbor.");
        assert_eq!(result.keywords(), ["harbor", "boats", "dawn"]);
        Ok(())
    }

    #[test]
    fn content_parts_array_is_joined() -> anyhow::Result<()> {
        let response = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "{\"title\":\"A\",\"description\":\"B\",\"keywords\":[]}"}
        ]}}]});
        let result = ResponseParser::default().parse(&response)?;
        assert_eq!(result.title(), "A");
        assert!(result.keywords().is_empty());
        Ok(())
    }

    #[test]
    fn unstructured_text_is_a_parse_error() {
        let err = ResponseParser::default()
            .parse(&chat("I cannot help with that image."))
            .err();
        assert_eq!(err, Some(ParseError::NoStructure));
        assert_eq!(
            ResponseParser::default().parse(&json!({"choices": []})).err(),
            Some(ParseError::NoStructure)
        );
    }

    #[test]
    fn blank_or_missing_fields_are_rejected() {
        let parser = ResponseParser::default();
        assert_eq!(
            parser
                .parse(&chat("{\"title\": \"  \", \"description\": \"d\"}"))
                .err(),
            Some(ParseError::EmptyField("title"))
        );
        assert_eq!(
            parser.parse(&chat("{\"title\": \"t\"}")).err(),
            Some(ParseError::MissingField("description"))
        );
        assert_eq!(
            parser.parse(&chat("Title: Only a title")).err(),
            Some(ParseError::MissingField("description"))
        );
    }

    #[test]
    fn service_error_object_is_reported() {
        let response = json!({"error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}});
        assert_eq!(
            ResponseParser::default().parse(&response).err(),
            Some(ParseError::ServiceError(
                "Incorrect API key provided".to_string()
            ))
        );
    }

    #[test]
    fn bare_result_object_is_accepted() -> anyhow::Result<()> {
        let response = json!({"title": "T", "description": "D", "keywords": ["x", "X"]});
        let result = ResponseParser::new(KeywordPolicy {
            case_sensitive: true,
        })
        .parse(&response)?;
        assert_eq!(result.keywords(), ["x", "X"]);
        Ok(())
    }

    #[test]
    fn code_fence_helpers() {
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("plain"), "plain");
        assert!(extract_json_object_from_text("no braces here").is_none());
        assert!(extract_json_object_from_text("[1, 2]").is_none());
    }
}
