use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use super::app::{settings_port, StoreApp, WindowRole, JSON_FILE_TABLES};
use crate::adapters::config::Settings;
use crate::adapters::fs::LocalFs;
use crate::core::chat::{load_all_chat_groups, load_single_chat_group};
use crate::core::json_file::{JsonFileOptions, JsonFilePersister, ListenMode};
use crate::core::ports::fs::FsPort;
use crate::core::session::{load_all_session_data, load_single_session};
use crate::core::table::{merge_tables, Tables};

/// Inspect and mirror the echonote data directory.
#[derive(Parser, Debug)]
#[command(name = "echonote-store", version, about)]
pub struct Cli {
    /// Data directory; defaults to `content_base_path` or the platform data dir
    #[arg(long, global = true)]
    pub base: Option<PathBuf>,

    /// Config file; defaults to ~/.echonote/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print loaded tables as JSON
    Dump {
        #[arg(long, value_enum, default_value_t = DumpScope::All)]
        scope: DumpScope,

        /// Only this session
        #[arg(long, conflicts_with = "chat")]
        session: Option<String>,

        /// Only this chat group
        #[arg(long)]
        chat: Option<String>,
    },
    /// Keep the store in sync with the data directory until Ctrl-C
    Watch {
        #[arg(long)]
        mode: Option<ListenMode>,

        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Follow files without ever writing them
        #[arg(long)]
        read_only: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DumpScope {
    All,
    Chats,
    Sessions,
    Files,
}

impl DumpScope {
    fn includes(self, other: DumpScope) -> bool {
        self == DumpScope::All || self == other
    }
}

fn load_settings(config: Option<&Path>) -> Settings {
    match config {
        Some(path) => Settings::load_from(path),
        None => Settings::load_global(),
    }
}

async fn dump_tables(
    settings: &Settings,
    base: Option<&Path>,
    scope: DumpScope,
    session: Option<&str>,
    chat: Option<&str>,
) -> Result<Tables, Box<dyn Error>> {
    let port = settings_port(settings, base);
    let data_dir = port.settings_base().await?;
    let fs: Arc<dyn FsPort> = Arc::new(LocalFs);
    let mut tables = Tables::new();

    if let Some(session_id) = session {
        let data = load_single_session(fs.as_ref(), &data_dir, session_id).await?;
        return Ok(data.into_tables());
    }
    if let Some(group_id) = chat {
        let data = load_single_chat_group(fs.as_ref(), &data_dir, group_id).await?;
        return Ok(data.into_tables());
    }

    if scope.includes(DumpScope::Chats) {
        let data = load_all_chat_groups(fs.as_ref(), &data_dir).await?;
        merge_tables(&mut tables, data.into_tables());
    }
    if scope.includes(DumpScope::Sessions) {
        let data = load_all_session_data(fs.as_ref(), &data_dir).await?;
        merge_tables(&mut tables, data.into_tables());
    }
    if scope.includes(DumpScope::Files) {
        for (table, filename, label) in JSON_FILE_TABLES {
            let persister = JsonFilePersister::new(
                JsonFileOptions::new(table, filename, label),
                Arc::clone(&port),
                Arc::clone(&fs),
                None,
            );
            if let Some(changes) = persister.load_content().await {
                merge_tables(&mut tables, changes.tables().clone());
            }
        }
    }

    Ok(tables)
}

async fn watch(
    mut settings: Settings,
    base: Option<&Path>,
    mode: Option<ListenMode>,
    poll_interval_ms: Option<u64>,
    read_only: bool,
) -> Result<(), Box<dyn Error>> {
    if let Some(mode) = mode {
        settings.listen_mode = mode;
    }
    if let Some(poll_interval_ms) = poll_interval_ms {
        settings.poll_interval_ms = poll_interval_ms;
    }
    let role = if read_only {
        WindowRole::Secondary
    } else {
        WindowRole::Main
    };

    let mut app = StoreApp::start(&settings, base, role).await?;
    let tables = app.store().get_tables();
    let rows: usize = tables.values().map(|table| table.len()).sum();
    log::info!(
        "[watch] {} tables, {} rows loaded from {}",
        tables.len(),
        rows,
        app.base().display()
    );

    tokio::signal::ctrl_c().await?;
    log::info!("[watch] shutting down");
    if !read_only {
        app.save_all().await;
    }
    app.stop();
    Ok(())
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn Error>> {
    let settings = load_settings(cli.config.as_deref());
    let base = cli.base.as_deref();

    match cli.command {
        Command::Dump {
            scope,
            session,
            chat,
        } => {
            let tables =
                dump_tables(&settings, base, scope, session.as_deref(), chat.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&tables)?);
        }
        Command::Watch {
            mode,
            poll_interval_ms,
            read_only,
        } => watch(settings, base, mode, poll_interval_ms, read_only).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{dump_tables, Cli, Command, DumpScope};
    use crate::adapters::config::Settings;
    use crate::core::json_file::ListenMode;
    use clap::Parser;

    #[test]
    fn parses_watch_flags() {
        let cli = Cli::try_parse_from([
            "echonote-store",
            "--base",
            "/tmp/echonote",
            "watch",
            "--mode",
            "both",
            "--poll-interval-ms",
            "1000",
        ])
        .expect("parse");
        assert_eq!(cli.base.as_deref(), Some(std::path::Path::new("/tmp/echonote")));
        match cli.command {
            Command::Watch {
                mode,
                poll_interval_ms,
                read_only,
            } => {
                assert_eq!(mode, Some(ListenMode::Both));
                assert_eq!(poll_interval_ms, Some(1000));
                assert!(!read_only);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_listen_mode() {
        let result = Cli::try_parse_from(["echonote-store", "watch", "--mode", "sometimes"]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dump_reads_every_source() {
        let base = std::env::temp_dir().join(format!("echonote-cli-test-{}", uuid::Uuid::new_v4()));
        let session_dir = base.join("sessions").join("s1");
        std::fs::create_dir_all(&session_dir).expect("create session dir");
        std::fs::write(session_dir.join("_meta.json"), r#"{"title":"Standup"}"#)
            .expect("write meta");
        std::fs::create_dir_all(base.join("chats").join("g1")).expect("create chat dir");
        std::fs::write(
            base.join("chats").join("g1").join("messages.json"),
            r#"{"chat_group":{"id":"g1"},"messages":[]}"#,
        )
        .expect("write chat");
        std::fs::write(base.join("templates.json"), r#"{"t1":{"title":"Weekly"}}"#)
            .expect("write templates");

        let settings = Settings::default();
        let tables = dump_tables(&settings, Some(&base), DumpScope::All, None, None)
            .await
            .expect("dump");
        assert!(tables["sessions"].contains_key("s1"));
        assert!(tables["chat_groups"].contains_key("g1"));
        assert!(tables["templates"].contains_key("t1"));

        let only_session = dump_tables(&settings, Some(&base), DumpScope::All, Some("s1"), None)
            .await
            .expect("dump session");
        assert!(!only_session.contains_key("chat_groups"));

        let _ = std::fs::remove_dir_all(base);
    }
}
