use serde::Deserialize;
use serde_json::Value;

use super::{extract_session_id_and_folder, LoadedSessionData, LABEL};
use crate::core::table::{split_id, with_id, Row};

/// Cells kept as serialized JSON text in the store.
const JSON_STRING_FIELDS: [&str; 2] = ["words", "speaker_hints"];

#[derive(Debug, Deserialize)]
struct TranscriptJson {
    #[serde(default)]
    transcripts: Vec<Row>,
}

fn stringify_arrays(row: &mut Row) {
    for field in JSON_STRING_FIELDS {
        if let Some(value) = row.get_mut(field) {
            if value.is_array() {
                *value = Value::String(value.to_string());
            }
        }
    }
}

pub(super) fn process_transcript_file(path: &str, content: &str, result: &mut LoadedSessionData) {
    let Some((session_id, _)) = extract_session_id_and_folder(path) else {
        return;
    };

    let data: TranscriptJson = match serde_json::from_str(content) {
        Ok(data) => data,
        Err(error) => {
            log::error!("[{}] Failed to parse transcript JSON {}: {}", LABEL, path, error);
            return;
        }
    };

    for transcript in data.transcripts {
        let Some((transcript_id, mut transcript)) = split_id(transcript) else {
            log::warn!("[{}] transcript without id in {}", LABEL, path);
            continue;
        };
        transcript.insert("session_id".to_string(), Value::String(session_id.clone()));
        stringify_arrays(&mut transcript);
        result.transcripts.insert(transcript_id, transcript);
    }
}

/// `transcript.json` content; JSON-string cells go back to arrays.
pub(super) fn transcript_file_value<'a>(
    transcripts: impl IntoIterator<Item = (&'a String, &'a Row)>,
) -> Value {
    let transcripts: Vec<Value> = transcripts
        .into_iter()
        .map(|(transcript_id, transcript)| {
            let mut record = with_id(transcript_id, transcript);
            record.remove("session_id");
            for field in JSON_STRING_FIELDS {
                let parsed = record
                    .get(field)
                    .and_then(Value::as_str)
                    .and_then(|text| serde_json::from_str::<Value>(text).ok())
                    .filter(Value::is_array);
                if let Some(parsed) = parsed {
                    record.insert(field.to_string(), parsed);
                }
            }
            Value::Object(record)
        })
        .collect();

    serde_json::json!({ "transcripts": transcripts })
}
