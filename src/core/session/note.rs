use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use super::{extract_session_id_and_folder, LoadedSessionData, LABEL};
use crate::adapters::markdown::{extract_text, parse_frontmatter, render_document};
use crate::core::paths::{sanitize_filename, SESSION_MEMO_FILE, SESSION_NOTE_EXTENSION};
use crate::core::table::{Row, Table};

/// Enhanced notes without a template.
pub(super) const SUMMARY_FILE: &str = "_summary.md";

#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct NoteFrontmatter {
    pub(super) id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
}

/// What a single note file contributes to the session tables.
#[derive(Debug, Clone, PartialEq)]
pub enum NoteOutcome {
    Memo { session_id: String, raw_md: String },
    Enhanced { note_id: String, note: Row },
    Skipped,
}

impl NoteOutcome {
    pub(super) fn apply(self, result: &mut LoadedSessionData) {
        match self {
            NoteOutcome::Memo { session_id, raw_md } => {
                result
                    .sessions
                    .entry(session_id)
                    .or_default()
                    .insert("raw_md".to_string(), Value::String(raw_md));
            }
            NoteOutcome::Enhanced { note_id, note } => {
                result.enhanced_notes.insert(note_id, note);
            }
            NoteOutcome::Skipped => {}
        }
    }
}

fn insert_string(row: &mut Row, key: &str, value: Option<String>) {
    if let Some(value) = value.filter(|value| !value.is_empty()) {
        row.insert(key.to_string(), Value::String(value));
    }
}

pub(super) async fn process_md_file(path: &str, content: &str) -> NoteOutcome {
    let Some((session_id, _)) = extract_session_id_and_folder(path) else {
        return NoteOutcome::Skipped;
    };

    let (frontmatter, body) = match parse_frontmatter::<NoteFrontmatter>(content) {
        Ok(parsed) => parsed,
        Err(error) => {
            log::error!("[{}] Failed to parse note {}: {}", LABEL, path, error);
            return NoteOutcome::Skipped;
        }
    };

    if extract_text(body).is_empty() {
        return NoteOutcome::Skipped;
    }
    let markdown = body.trim().to_string();

    if path.ends_with(&format!("/{}", SESSION_MEMO_FILE)) {
        return NoteOutcome::Memo {
            session_id,
            raw_md: markdown,
        };
    }

    let Some(note_id) = frontmatter.id.filter(|id| !id.trim().is_empty()) else {
        log::warn!("[{}] note without id in {}, skipping", LABEL, path);
        return NoteOutcome::Skipped;
    };

    if let Some(declared) = frontmatter.session_id.as_deref() {
        if declared != session_id {
            log::warn!(
                "[{}] note {} declares session {} but lives under {}",
                LABEL,
                note_id,
                declared,
                session_id
            );
        }
    }

    let mut note = Row::new();
    note.insert("session_id".to_string(), Value::String(session_id));
    note.insert("content".to_string(), Value::String(markdown));
    insert_string(&mut note, "template_id", frontmatter.template_id);
    insert_string(&mut note, "title", frontmatter.title);
    if let Some(position) = frontmatter.position {
        note.insert("position".to_string(), Value::Number(Number::from(position)));
    }

    NoteOutcome::Enhanced { note_id, note }
}

fn string_cell(row: &Row, key: &str) -> Option<String> {
    row.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
}

/// File name for an enhanced note: its template's title, the template id
/// when the template is unknown, or `_summary.md` without a template.
pub(super) fn note_filename(note: &Row, templates: &Table) -> String {
    let Some(template_id) = string_cell(note, "template_id") else {
        return SUMMARY_FILE.to_string();
    };
    let name = templates
        .get(&template_id)
        .and_then(|template| string_cell(template, "title"))
        .unwrap_or(template_id);
    format!("{}{}", sanitize_filename(&name), SESSION_NOTE_EXTENSION)
}

/// Markdown document for an enhanced note, `None` when it has no content.
pub(super) fn note_document(note_id: &str, session_id: &str, note: &Row) -> Option<String> {
    let content = string_cell(note, "content")?;
    let frontmatter = NoteFrontmatter {
        id: Some(note_id.to_string()),
        session_id: Some(session_id.to_string()),
        template_id: string_cell(note, "template_id"),
        position: note.get("position").and_then(Value::as_i64),
        title: string_cell(note, "title"),
    };
    render(&frontmatter, &content, note_id)
}

/// `_memo.md` document for a session, `None` when `raw_md` is empty.
pub(super) fn memo_document(session_id: &str, session: &Row) -> Option<String> {
    let raw_md = string_cell(session, "raw_md")?;
    let frontmatter = NoteFrontmatter {
        id: Some(session_id.to_string()),
        session_id: Some(session_id.to_string()),
        ..NoteFrontmatter::default()
    };
    render(&frontmatter, &raw_md, session_id)
}

fn render(frontmatter: &NoteFrontmatter, body: &str, id: &str) -> Option<String> {
    match render_document(frontmatter, body) {
        Ok(document) => Some(document),
        Err(error) => {
            log::error!("[{}] Failed to render note {}: {}", LABEL, id, error);
            None
        }
    }
}

/// Id declared in a note's frontmatter, if the file is one this crate wrote.
pub(super) fn declared_note_id(content: &str) -> Option<String> {
    parse_frontmatter::<NoteFrontmatter>(content)
        .ok()
        .and_then(|(frontmatter, _)| frontmatter.id)
        .filter(|id| !id.trim().is_empty())
}
