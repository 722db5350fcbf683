use serde_json::Value;

use super::{LoadedSessionData, LABEL};
use crate::core::paths::SESSIONS_DIR;
use crate::core::table::{split_id, with_id, Row};

/// Returns `(session_id, folder_path)` for a file inside a session folder,
/// e.g. `/data/sessions/work/2024/s1/_meta.json` -> `("s1", "work/2024")`.
pub fn extract_session_id_and_folder(path: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 2 {
        return None;
    }

    let session_index = parts.len() - 2;
    let session_id = parts[session_index];
    if session_id.is_empty() {
        return None;
    }

    let folder = match parts[..session_index]
        .iter()
        .rposition(|part| *part == SESSIONS_DIR)
    {
        Some(sessions_index) => parts[sessions_index + 1..session_index].join("/"),
        None => String::new(),
    };

    Some((session_id.to_string(), folder))
}

fn take_participants(session: &mut Row) -> Vec<Row> {
    match session.remove("participants") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub(super) fn process_meta_file(path: &str, content: &str, result: &mut LoadedSessionData) {
    let Some((session_id, folder)) = extract_session_id_and_folder(path) else {
        return;
    };

    let mut session: Row = match serde_json::from_str(content) {
        Ok(session) => session,
        Err(error) => {
            log::error!("[{}] Failed to parse meta JSON {}: {}", LABEL, path, error);
            return;
        }
    };
    session.remove("id");

    for participant in take_participants(&mut session) {
        let Some((mapping_id, mut mapping)) = split_id(participant) else {
            log::warn!("[{}] participant without id in {}", LABEL, path);
            continue;
        };
        mapping.insert("session_id".to_string(), Value::String(session_id.clone()));
        result.mapping_session_participant.insert(mapping_id, mapping);
    }

    if !folder.is_empty() {
        session.insert("folder_id".to_string(), Value::String(folder));
    }

    result.sessions.insert(session_id, session);
}

/// `_meta.json` content for a session: the row without the cells that live
/// elsewhere on disk, plus its participants.
pub(super) fn meta_file_value<'a>(
    session_id: &str,
    session: &Row,
    participants: impl IntoIterator<Item = (&'a String, &'a Row)>,
) -> Value {
    let mut meta = with_id(session_id, session);
    meta.remove("raw_md");
    meta.remove("folder_id");

    let participants: Vec<Value> = participants
        .into_iter()
        .map(|(mapping_id, mapping)| {
            let mut mapping = with_id(mapping_id, mapping);
            mapping.remove("session_id");
            Value::Object(mapping)
        })
        .collect();
    meta.insert("participants".to_string(), Value::Array(participants));

    Value::Object(meta)
}
