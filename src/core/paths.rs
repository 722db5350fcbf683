use std::path::{Path, PathBuf};

pub const SESSION_META_FILE: &str = "_meta.json";
pub const SESSION_TRANSCRIPT_FILE: &str = "transcript.json";
pub const SESSION_NOTE_EXTENSION: &str = ".md";
pub const SESSION_MEMO_FILE: &str = "_memo.md";
pub const CHAT_MESSAGES_FILE: &str = "messages.json";

pub const CHATS_DIR: &str = "chats";
pub const SESSIONS_DIR: &str = "sessions";

/// `/`-separated form used for scan keys and change notifications.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

pub fn build_session_path(data_dir: &Path, session_id: &str, folder_path: &str) -> PathBuf {
    let mut path = data_dir.join(SESSIONS_DIR);
    for part in folder_path.split('/').filter(|part| !part.is_empty()) {
        path.push(part);
    }
    path.join(session_id)
}

pub fn build_chat_path(data_dir: &Path, chat_group_id: &str) -> PathBuf {
    data_dir.join(CHATS_DIR).join(chat_group_id)
}

pub fn build_chat_file_path(data_dir: &Path, chat_group_id: &str) -> PathBuf {
    build_chat_path(data_dir, chat_group_id).join(CHAT_MESSAGES_FILE)
}

pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Id of the entity folder directly below `dir_name`, e.g.
/// `chats/g1/messages.json` -> `g1` for `dir_name = "chats"`.
pub fn folder_entity_id(path: &str, dir_name: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('/').collect();
    let dir_index = parts.iter().position(|part| *part == dir_name)?;
    parts
        .get(dir_index + 1)
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_path_nests_folders() {
        let path = build_session_path(Path::new("/data"), "s1", "work/2024");
        assert_eq!(normalize_path(&path), "/data/sessions/work/2024/s1");
        let flat = build_session_path(Path::new("/data"), "s1", "");
        assert_eq!(normalize_path(&flat), "/data/sessions/s1");
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_filename(" Q3: plan/review? "), "Q3_ plan_review_");
    }

    #[test]
    fn folder_entity_id_reads_segment_after_dir() {
        assert_eq!(
            folder_entity_id("chats/g1/messages.json", CHATS_DIR),
            Some("g1".to_string())
        );
        assert_eq!(folder_entity_id("chats", CHATS_DIR), None);
        assert_eq!(folder_entity_id("sessions/s1/_meta.json", CHATS_DIR), None);
    }
}
