mod meta;
mod note;
pub mod persister;
mod transcript;

use std::collections::BTreeMap;
use std::path::Path;

use futures::future::join_all;

use crate::core::paths::{
    SESSIONS_DIR, SESSION_META_FILE, SESSION_NOTE_EXTENSION, SESSION_TRANSCRIPT_FILE,
};
use crate::core::ports::fs::{FsError, FsPort};
use crate::core::table::{Table, Tables};

pub use meta::extract_session_id_and_folder;
pub use note::NoteOutcome;
pub use persister::{create_session_persister, SessionDirPersister};

const LABEL: &str = "SessionPersister";

pub const SESSIONS_TABLE: &str = "sessions";
pub const TRANSCRIPTS_TABLE: &str = "transcripts";
pub const ENHANCED_NOTES_TABLE: &str = "enhanced_notes";
pub const SESSION_PARTICIPANTS_TABLE: &str = "mapping_session_participant";

const NOTE_PATTERN: &str = "*.md";
const SCAN_PATTERNS: [&str; 3] = [SESSION_META_FILE, SESSION_TRANSCRIPT_FILE, NOTE_PATTERN];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedSessionData {
    pub sessions: Table,
    pub transcripts: Table,
    pub enhanced_notes: Table,
    pub mapping_session_participant: Table,
}

impl LoadedSessionData {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
            && self.transcripts.is_empty()
            && self.enhanced_notes.is_empty()
            && self.mapping_session_participant.is_empty()
    }

    pub fn into_tables(self) -> Tables {
        let mut tables = Tables::new();
        tables.insert(SESSIONS_TABLE.to_string(), self.sessions);
        tables.insert(TRANSCRIPTS_TABLE.to_string(), self.transcripts);
        tables.insert(ENHANCED_NOTES_TABLE.to_string(), self.enhanced_notes);
        tables.insert(
            SESSION_PARTICIPANTS_TABLE.to_string(),
            self.mapping_session_participant,
        );
        tables
    }
}

pub fn create_empty_loaded_session_data() -> LoadedSessionData {
    LoadedSessionData::default()
}

fn readable<'a>(
    files: &'a BTreeMap<String, Option<String>>,
    suffix: &'a str,
) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    files.iter().filter_map(move |(path, content)| {
        let content = content.as_deref().filter(|content| !content.is_empty())?;
        path.ends_with(suffix).then_some((path.as_str(), content))
    })
}

/// Assembles scanned files into session tables. Metadata goes first, then
/// transcripts; notes are parsed concurrently once both passes are done.
pub async fn process_files(files: &BTreeMap<String, Option<String>>) -> LoadedSessionData {
    let mut result = create_empty_loaded_session_data();

    for (path, content) in readable(files, SESSION_META_FILE) {
        meta::process_meta_file(path, content, &mut result);
    }

    for (path, content) in readable(files, SESSION_TRANSCRIPT_FILE) {
        transcript::process_transcript_file(path, content, &mut result);
    }

    let outcomes = join_all(
        readable(files, SESSION_NOTE_EXTENSION)
            .map(|(path, content)| note::process_md_file(path, content)),
    )
    .await;
    for outcome in outcomes {
        outcome.apply(&mut result);
    }

    result
}

async fn load_sessions(
    fs: &dyn FsPort,
    data_dir: &Path,
    path_filter: Option<&str>,
) -> Result<LoadedSessionData, FsError> {
    let sessions_dir = data_dir.join(SESSIONS_DIR);

    let scan = match fs
        .scan_and_read(&sessions_dir, &SCAN_PATTERNS, true, path_filter)
        .await
    {
        Ok(scan) => scan,
        Err(error) if error.is_directory_not_found() => {
            return Ok(create_empty_loaded_session_data());
        }
        Err(error) => {
            log::error!("[{}] scan error: {}", LABEL, error);
            return Err(error);
        }
    };

    Ok(process_files(&scan.files).await)
}

pub async fn load_all_session_data(
    fs: &dyn FsPort,
    data_dir: &Path,
) -> Result<LoadedSessionData, FsError> {
    load_sessions(fs, data_dir, None).await
}

/// Loads one session; only paths containing `/{session_id}/` are read.
pub async fn load_single_session(
    fs: &dyn FsPort,
    data_dir: &Path,
    session_id: &str,
) -> Result<LoadedSessionData, FsError> {
    let filter = format!("/{}/", session_id);
    load_sessions(fs, data_dir, Some(&filter)).await
}
