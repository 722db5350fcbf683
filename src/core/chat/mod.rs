pub mod persister;

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::paths::{build_chat_file_path, CHATS_DIR, CHAT_MESSAGES_FILE};
use crate::core::ports::fs::{FsError, FsPort};
use crate::core::table::{split_id, with_id, Row, Table, Tables};

pub use persister::{create_chat_persister, ChatDirPersister};

const LABEL: &str = "ChatPersister";

pub const CHAT_GROUPS_TABLE: &str = "chat_groups";
pub const CHAT_MESSAGES_TABLE: &str = "chat_messages";

/// On-disk shape of `chats/{group_id}/messages.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatJson {
    pub chat_group: Row,
    #[serde(default)]
    pub messages: Vec<Row>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedChatData {
    pub chat_groups: Table,
    pub chat_messages: Table,
}

impl LoadedChatData {
    pub fn is_empty(&self) -> bool {
        self.chat_groups.is_empty() && self.chat_messages.is_empty()
    }

    pub fn into_tables(self) -> Tables {
        let mut tables = Tables::new();
        tables.insert(CHAT_GROUPS_TABLE.to_string(), self.chat_groups);
        tables.insert(CHAT_MESSAGES_TABLE.to_string(), self.chat_messages);
        tables
    }
}

/// Messages belong to the group whose file contains them; each one gets
/// `chat_group_id` set to that group regardless of what the file says.
pub fn chat_json_to_data(json: ChatJson) -> LoadedChatData {
    let mut result = LoadedChatData::default();

    let group_id = match split_id(json.chat_group) {
        Some((group_id, group)) => {
            result.chat_groups.insert(group_id.clone(), group);
            Some(group_id)
        }
        None => {
            log::warn!("[{}] chat group without id, skipping group row", LABEL);
            None
        }
    };

    for message in json.messages {
        match split_id(message) {
            Some((message_id, mut message)) => {
                if let Some(group_id) = &group_id {
                    message.insert(
                        persister::CHAT_GROUP_ID_FIELD.to_string(),
                        Value::String(group_id.clone()),
                    );
                }
                result.chat_messages.insert(message_id, message);
            }
            None => log::warn!("[{}] chat message without id, skipping", LABEL),
        }
    }

    result
}

/// Builds the file document for one group from store rows.
pub fn chat_data_to_json<'a>(
    group_id: &str,
    group: &Row,
    messages: impl IntoIterator<Item = (&'a String, &'a Row)>,
) -> ChatJson {
    ChatJson {
        chat_group: with_id(group_id, group),
        messages: messages
            .into_iter()
            .map(|(message_id, message)| with_id(message_id, message))
            .collect(),
    }
}

/// Per-table shallow union; a later fragment replaces the whole entity.
pub fn merge_loaded_data(items: impl IntoIterator<Item = LoadedChatData>) -> LoadedChatData {
    let mut result = LoadedChatData::default();
    for item in items {
        result.chat_groups.extend(item.chat_groups);
        result.chat_messages.extend(item.chat_messages);
    }
    result
}

pub fn create_empty_loaded_chat_data() -> LoadedChatData {
    LoadedChatData::default()
}

fn parse_chat_json(content: &str) -> Result<ChatJson, serde_json::Error> {
    serde_json::from_str::<ChatJson>(content)
}

pub async fn load_all_chat_groups(
    fs: &dyn FsPort,
    data_dir: &Path,
) -> Result<LoadedChatData, FsError> {
    let chats_dir = data_dir.join(CHATS_DIR);

    let scan = match fs
        .scan_and_read(&chats_dir, &[CHAT_MESSAGES_FILE], false, None)
        .await
    {
        Ok(scan) => scan,
        Err(error) if error.is_directory_not_found() => {
            return Ok(create_empty_loaded_chat_data());
        }
        Err(error) => {
            log::error!("[{}] scan error: {}", LABEL, error);
            return Err(error);
        }
    };

    let mut items = Vec::with_capacity(scan.files.len());
    for (path, content) in &scan.files {
        let Some(content) = content.as_deref().filter(|c| !c.is_empty()) else {
            continue;
        };
        match parse_chat_json(content) {
            Ok(json) => items.push(chat_json_to_data(json)),
            Err(error) => {
                log::error!("[{}] Failed to parse chat JSON {}: {}", LABEL, path, error);
            }
        }
    }

    Ok(merge_loaded_data(items))
}

pub async fn load_single_chat_group(
    fs: &dyn FsPort,
    data_dir: &Path,
    group_id: &str,
) -> Result<LoadedChatData, FsError> {
    let file_path = build_chat_file_path(data_dir, group_id);

    let content = match fs.read_text_file(&file_path).await {
        Ok(content) => content,
        Err(error) if error.is_file_not_found() => return Ok(create_empty_loaded_chat_data()),
        Err(error) => {
            log::error!(
                "[{}] Failed to load chat group {}: {}",
                LABEL,
                group_id,
                error
            );
            return Err(error);
        }
    };

    parse_chat_json(&content)
        .map(chat_json_to_data)
        .map_err(|source| {
            log::error!(
                "[{}] Failed to parse chat JSON for {}: {}",
                LABEL,
                group_id,
                source
            );
            FsError::Parse {
                path: file_path,
                source,
            }
        })
}

pub(crate) fn chat_json_value(json: &ChatJson) -> Value {
    serde_json::json!({
        "chat_group": json.chat_group,
        "messages": json.messages,
    })
}
