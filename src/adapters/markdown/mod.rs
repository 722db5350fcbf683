use pulldown_cmark::{Event, Parser, TagEnd};
use serde::de::DeserializeOwned;
use serde::Serialize;

const FENCE: &str = "---";

/// Splits a leading `---` fenced YAML block from the body. Returns
/// `(None, markdown)` when there is no closed fence.
pub fn split_frontmatter(markdown: &str) -> (Option<&str>, &str) {
    let mut lines = markdown.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return (None, markdown);
    };
    if first.trim_end() != FENCE {
        return (None, markdown);
    }

    let yaml_start = first.len();
    let mut offset = yaml_start;
    for line in lines {
        if line.trim_end() == FENCE {
            let yaml = &markdown[yaml_start..offset];
            let body = &markdown[offset + line.len()..];
            return (Some(yaml), body);
        }
        offset += line.len();
    }

    (None, markdown)
}

#[derive(Debug, thiserror::Error)]
#[error("invalid frontmatter: {0}")]
pub struct FrontmatterError(#[from] serde_yaml_ng::Error);

/// Deserializes the frontmatter block into `T`; a document without one
/// yields `T::default()`.
pub fn parse_frontmatter<T>(markdown: &str) -> Result<(T, &str), FrontmatterError>
where
    T: DeserializeOwned + Default,
{
    match split_frontmatter(markdown) {
        (Some(yaml), body) if !yaml.trim().is_empty() => {
            Ok((serde_yaml_ng::from_str(yaml)?, body))
        }
        (_, body) => Ok((T::default(), body)),
    }
}

/// Renders `frontmatter` as a fenced YAML block followed by `body`.
pub fn render_document<T: Serialize>(frontmatter: &T, body: &str) -> Result<String, FrontmatterError> {
    let yaml = serde_yaml_ng::to_string(frontmatter)?;
    Ok(format!("{FENCE}\n{yaml}{FENCE}\n\n{}\n", body.trim()))
}

pub fn extract_text(markdown: &str) -> String {
    let mut text = String::new();
    let (_, content) = split_frontmatter(markdown);
    let parser = Parser::new(content);

    for event in parser {
        match event {
            Event::Text(t) | Event::Code(t) => {
                text.push_str(&t);
                text.push(' ');
            }
            Event::SoftBreak | Event::HardBreak => {
                text.push('\n');
            }
            Event::End(TagEnd::Paragraph) | Event::End(TagEnd::Heading(_)) => {
                text.push('\n');
            }
            _ => {}
        }
    }

    text.trim().to_string()
}
