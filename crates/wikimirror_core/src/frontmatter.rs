//! YAML header linking a local Markdown file to its remote page.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ParseError;

const DELIMITER: &str = "---";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageFrontMatter {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_id"
    )]
    pub page_id: Option<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_id"
    )]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Page ids are strings, but hand-edited headers often write them as numbers.
fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u64),
    }

    Ok(
        Option::<RawId>::deserialize(deserializer)?.and_then(|raw| match raw {
            RawId::Text(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            RawId::Number(number) => Some(number.to_string()),
        }),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFile {
    pub front_matter: PageFrontMatter,
    pub body: String,
}

/// Split a page file into its header and Markdown body.
///
/// Files without a header parse to a default (local-only) header and the whole
/// text as body.
pub fn parse_page_file(text: &str) -> Result<PageFile, ParseError> {
    let Some((yaml, body)) = split_header(text) else {
        return Ok(PageFile {
            front_matter: PageFrontMatter::default(),
            body: text.to_string(),
        });
    };
    let front_matter = if yaml.trim().is_empty() {
        PageFrontMatter::default()
    } else {
        serde_yaml::from_str(yaml).map_err(|error| ParseError::FrontMatter(error.to_string()))?
    };
    Ok(PageFile {
        front_matter,
        body: body.to_string(),
    })
}

pub fn render_page_file(front_matter: &PageFrontMatter, body: &str) -> Result<String, ParseError> {
    let yaml = serde_yaml::to_string(front_matter)
        .map_err(|error| ParseError::FrontMatter(error.to_string()))?;
    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n\n{body}"))
}

fn split_header(text: &str) -> Option<(&str, &str)> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == DELIMITER {
            let yaml = &rest[..offset];
            let after = &rest[offset + line.len()..];
            let body = after
                .strip_prefix("\r\n")
                .or_else(|| after.strip_prefix('\n'))
                .unwrap_or(after);
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> PageFrontMatter {
        PageFrontMatter {
            page_id: Some("123".to_string()),
            version: 4,
            title: "Getting Started".to_string(),
            updated: Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("timestamp")),
            parent_id: Some("100".to_string()),
            position: Some(0),
            content_hash: Some("abc123".to_string()),
        }
    }

    #[test]
    fn render_then_parse_preserves_header_and_body() {
        let body = "# Getting Started\n\nHello.\n";
        let rendered = render_page_file(&sample(), body).expect("render");
        assert!(rendered.starts_with("---\npageId: '123'\nversion: 4\ntitle: Getting Started\n"));
        assert!(rendered.contains("contentHash: abc123\n---\n\n# Getting Started"));

        let parsed = parse_page_file(&rendered).expect("parse");
        assert_eq!(parsed.front_matter, sample());
        assert_eq!(parsed.body, body);
    }

    #[test]
    fn file_without_header_is_local_only() {
        let parsed = parse_page_file("# Draft\n\nNot pushed yet.\n").expect("parse");
        assert_eq!(parsed.front_matter, PageFrontMatter::default());
        assert!(parsed.front_matter.page_id.is_none());
        assert_eq!(parsed.body, "# Draft\n\nNot pushed yet.\n");
    }

    #[test]
    fn numeric_ids_and_missing_fields_are_accepted() {
        let parsed = parse_page_file("---\npageId: 42\ntitle: Notes\n---\nbody\n").expect("parse");
        assert_eq!(parsed.front_matter.page_id.as_deref(), Some("42"));
        assert_eq!(parsed.front_matter.version, 0);
        assert!(parsed.front_matter.content_hash.is_none());
        assert_eq!(parsed.body, "body\n");
    }

    #[test]
    fn unterminated_header_is_treated_as_body() {
        let text = "---\ntitle: Notes\nno closing line\n";
        let parsed = parse_page_file(text).expect("parse");
        assert_eq!(parsed.body, text);
    }

    #[test]
    fn malformed_yaml_is_a_front_matter_error() {
        let error = parse_page_file("---\ntitle: [unclosed\n---\n").expect_err("must fail");
        assert!(matches!(error, ParseError::FrontMatter(_)));
    }
}
