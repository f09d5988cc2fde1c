//! CLI Command Handlers
//!
//! Implements all CLI commands on top of the library.
//! Each handler takes CLI args, config and Output, returns ExitCode.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::app::{PlaybackError, StreamApp};
use crate::cli::{
    ConfigCmd, ConfigResponse, ExitCode, FilesCmd, FilesResponse, Output, PlayCmd, PlayResponse,
    ServeCmd, ServeResponse, ServedFile, SourceArgs,
};
use crate::config::Config;
use crate::engine::{got_metadata, EngineError, LocalEngine, TransferEngine};
use crate::models::{human_size, FileEntry};
use crate::player::{PlayerError, SessionEnd};
use crate::storage::MemoryStorage;

// =============================================================================
// Shared Setup
// =============================================================================

async fn open_engine(
    source: &SourceArgs,
    config: &Config,
    storage: &MemoryStorage,
    output: &Output,
) -> Result<Arc<LocalEngine>, ExitCode> {
    let piece_length = source.piece_length.unwrap_or(config.piece_length);
    if piece_length == 0 {
        return Err(output.error("Piece length must be positive", ExitCode::InvalidArgs));
    }
    match LocalEngine::open(source.paths.clone(), piece_length, storage).await {
        Ok(engine) => Ok(Arc::new(engine)),
        Err(EngineError::Source(e)) => Err(output.error(
            format!("Cannot read source files: {}", e),
            ExitCode::InvalidArgs,
        )),
        Err(e) => Err(output.error(format!("Failed to open transfer: {}", e), ExitCode::Error)),
    }
}

async fn open_app(
    source: &SourceArgs,
    config: &Config,
    storage: &MemoryStorage,
    output: &Output,
) -> Result<StreamApp, ExitCode> {
    let engine: Arc<dyn TransferEngine> = open_engine(source, config, storage, output).await?;
    match StreamApp::open(engine, storage, config.readahead_min_bytes).await {
        Ok(app) => Ok(app),
        Err(e) => Err(output.error(format!("Failed to start: {}", e), ExitCode::Error)),
    }
}

fn playback_exit_code(e: &PlaybackError) -> ExitCode {
    match e {
        PlaybackError::NoMedia => ExitCode::NoMedia,
        PlaybackError::IndexOutOfRange { .. } => ExitCode::InvalidArgs,
        PlaybackError::Player(PlayerError::NotFound(_)) => ExitCode::PlayerNotFound,
        PlaybackError::Player(PlayerError::StartFailed(_))
        | PlaybackError::Player(PlayerError::ConnectFailed { .. }) => ExitCode::LaunchFailed,
        _ => ExitCode::Error,
    }
}

fn print_entry(entry: &FileEntry) {
    println!(
        "  [{}] {}  {}  pieces {}..{}",
        entry.index,
        entry.path,
        human_size(entry.length),
        entry.begin_piece,
        entry.end_piece
    );
}

// =============================================================================
// Files Command
// =============================================================================

pub async fn files_cmd(cmd: FilesCmd, config: &Config, output: &Output) -> ExitCode {
    let storage = MemoryStorage::new();
    let engine = match open_engine(&cmd.source, config, &storage, output).await {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    let layout = match got_metadata(engine.as_ref()).await {
        Ok(layout) => layout,
        Err(e) => return output.error(format!("No metadata: {}", e), ExitCode::Error),
    };

    let mut files = layout.entries();
    if cmd.media {
        files.retain(FileEntry::is_media);
        files.sort_by(|a, b| a.path.cmp(&b.path));
        if files.is_empty() {
            return output.error("No playable media files", ExitCode::NoMedia);
        }
    }

    if output.json {
        let response = FilesResponse {
            transfer: layout.id.to_string(),
            name: layout.name.clone(),
            piece_length: layout.piece_length,
            pieces: layout.piece_count(),
            files,
        };
        if let Err(e) = output.print(&response) {
            return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
        }
    } else {
        println!(
            "{} ({}, {} pieces of {})",
            layout.name,
            human_size(layout.total_length()),
            layout.piece_count(),
            human_size(layout.piece_length)
        );
        files.iter().for_each(print_entry);
    }
    storage.close();
    ExitCode::Success
}

// =============================================================================
// Serve Command
// =============================================================================

pub async fn serve_cmd(cmd: ServeCmd, config: &Config, output: &Output) -> ExitCode {
    let storage = MemoryStorage::new();
    let app = match open_app(&cmd.source, config, &storage, output).await {
        Ok(app) => app,
        Err(code) => return code,
    };

    let published = match app.publish_media() {
        Ok(published) => published,
        Err(e) => return output.error(e.to_string(), playback_exit_code(&e)),
    };

    let response = ServeResponse {
        address: app.server().local_addr().to_string(),
        files: published
            .into_iter()
            .enumerate()
            .map(|(index, (entry, url))| ServedFile {
                index,
                name: entry.name,
                length: entry.length,
                url,
            })
            .collect(),
    };
    if output.json {
        if let Err(e) = output.print(&response) {
            return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
        }
    } else {
        println!("Serving on http://{}", response.address);
        for file in &response.files {
            println!("  [{}] {}  {}", file.index, file.name, file.url);
        }
    }

    output.info("Press Ctrl-C to stop.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        output.info(format!("Cannot listen for Ctrl-C: {}", e));
    }
    app.shutdown().await;
    storage.close();
    ExitCode::Success
}

// =============================================================================
// Play Command
// =============================================================================

pub async fn play_cmd(cmd: PlayCmd, config: &Config, output: &Output) -> ExitCode {
    let options = match config.launch_options(cmd.mpv.as_deref()) {
        Ok(options) => options,
        Err(e) => return output.error(e.to_string(), ExitCode::PlayerNotFound),
    };

    let storage = MemoryStorage::new();
    let app = match open_app(&cmd.source, config, &storage, output).await {
        Ok(app) => app,
        Err(code) => return code,
    };

    let all = cmd.stream_all(config.stream_all);
    if let Some(entry) = app.media_files().get(cmd.index) {
        output.info(format!("Playing {}{}", entry, if all { " (and following)" } else { "" }));
    }

    match app.play(cmd.index, all, options).await {
        Ok(()) => {}
        Err(PlaybackError::Player(e @ PlayerError::ConnectFailed { .. })) => {
            // mpv plays fine without its control channel; only eviction is lost
            output.info(format!("Warning: {}; continuing without player control", e));
        }
        Err(e) => {
            let code = output.error(e.to_string(), playback_exit_code(&e));
            app.shutdown().await;
            return code;
        }
    }

    let end = watch_playback(&app, output).await;
    let last = app.status();
    app.shutdown().await;
    storage.close();

    let response = PlayResponse {
        status: "ended",
        exit: end.to_string(),
        clean: end.is_clean(),
        last,
    };
    if output.json {
        if let Err(e) = output.print(&response) {
            return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
        }
    } else {
        output.info(format!("Player {}", response.exit));
    }
    ExitCode::Success
}

/// Report status every second until the player exits or Ctrl-C stops it.
async fn watch_playback(app: &StreamApp, output: &Output) -> SessionEnd {
    let ended = app.wait_ended();
    tokio::pin!(ended);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            end = &mut ended => {
                return end.unwrap_or(SessionEnd::WaitFailed("no playback session".to_string()));
            }
            _ = &mut ctrl_c => {
                output.info("Stopping playback...");
                return app
                    .stop()
                    .await
                    .unwrap_or(SessionEnd::WaitFailed("no playback session".to_string()));
            }
            _ = ticker.tick() => {
                let status = app.status();
                if output.json {
                    if !output.quiet {
                        let _ = output.print_line(&status);
                    }
                } else {
                    output.info(&status);
                }
            }
        }
    }
}

// =============================================================================
// Config Command
// =============================================================================

pub async fn config_cmd(
    cmd: ConfigCmd,
    mut config: Config,
    config_path: Option<&Path>,
    output: &Output,
) -> ExitCode {
    let path = config_path.map(Path::to_path_buf).or_else(Config::path);

    if cmd.is_update() {
        if cmd.clear_mpv_path {
            config.mpv_path = None;
        }
        if let Some(mpv_path) = cmd.mpv_path {
            config.mpv_path = Some(mpv_path);
        }
        let Some(path) = path.as_deref() else {
            return output.error("Could not determine config path", ExitCode::Error);
        };
        if let Err(e) = config.save_to(path) {
            return output.error(format!("Failed to save config: {}", e), ExitCode::Error);
        }
        output.info(format!("Saved {}", path.display()));
    }

    if output.json {
        let response = ConfigResponse { path, config };
        if let Err(e) = output.print(&response) {
            return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
        }
    } else {
        if let Some(path) = &path {
            println!("# {}", path.display());
        }
        match toml::to_string_pretty(&config) {
            Ok(text) => print!("{}", text),
            Err(e) => return output.error(format!("Failed to serialize: {}", e), ExitCode::Error),
        }
    }
    ExitCode::Success
}
