//! mpv JSON IPC messages
//!
//! Outbound: `{"command": [<verb>, <args>...], "request_id": <n>}`, one per line.
//! Inbound: events (`{"event": "property-change", "name": ..., "data": ...}`)
//! and command replies (`{"request_id": n, "error": "success", ...}`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Observer id used for playlist position notifications
pub const PLAYLIST_POS_OBSERVER: u64 = 1;

/// Commands sent to the player
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `loadfile <url> append`
    LoadFile { url: String },
    SetProperty { name: String, value: Value },
    ObserveProperty { id: u64, name: String },
    Quit,
}

impl Command {
    pub fn append(url: impl Into<String>) -> Self {
        Command::LoadFile { url: url.into() }
    }

    /// Display title of playlist item `index`
    pub fn set_item_title(index: usize, title: &str) -> Self {
        Command::SetProperty {
            name: format!("playlist/{}/title", index),
            value: json!(title),
        }
    }

    pub fn set_playlist_pos(index: usize) -> Self {
        Command::SetProperty {
            name: "playlist-pos".to_string(),
            value: json!(index),
        }
    }

    pub fn set_media_title(title: &str) -> Self {
        Command::SetProperty {
            name: "force-media-title".to_string(),
            value: json!(title),
        }
    }

    pub fn observe_playlist_pos() -> Self {
        Command::ObserveProperty {
            id: PLAYLIST_POS_OBSERVER,
            name: "playlist-pos".to_string(),
        }
    }

    /// Verb as the player spells it
    pub fn verb(&self) -> &'static str {
        match self {
            Command::LoadFile { .. } => "loadfile",
            Command::SetProperty { .. } => "set_property",
            Command::ObserveProperty { .. } => "observe_property",
            Command::Quit => "quit",
        }
    }

    fn args(&self) -> Vec<Value> {
        let mut args = vec![json!(self.verb())];
        match self {
            Command::LoadFile { url } => {
                args.push(json!(url));
                args.push(json!("append"));
            }
            Command::SetProperty { name, value } => {
                args.push(json!(name));
                args.push(value.clone());
            }
            Command::ObserveProperty { id, name } => {
                args.push(json!(id));
                args.push(json!(name));
            }
            Command::Quit => {}
        }
        args
    }

    /// Newline-terminated JSON line for this command
    pub fn encode(&self, request_id: u64) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(&Request {
            command: self.args(),
            request_id,
        })?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Serialize)]
struct Request {
    command: Vec<Value>,
    request_id: u64,
}

#[derive(Debug, Deserialize)]
struct Message {
    event: Option<String>,
    name: Option<String>,
    #[serde(default)]
    data: Value,
    request_id: Option<u64>,
    error: Option<String>,
}

/// Messages received from the player
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `playlist-pos` changed to a valid index
    PlaylistPos(usize),
    /// Any other observed property change
    PropertyChange { name: String, data: Value },
    /// Reply to a command; `error` is `None` on success
    Reply {
        request_id: u64,
        error: Option<String>,
    },
    /// Unobserved event such as `start-file` or `idle`
    Other(String),
}

/// Parse one inbound line. Malformed or unrecognised lines yield `None`.
pub fn parse_line(line: &str) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let message: Message = serde_json::from_str(line).ok()?;

    match message.event.as_deref() {
        Some("property-change") => {
            let name = message.name?;
            if name == "playlist-pos" {
                if let Some(pos) = message.data.as_u64() {
                    return Some(Event::PlaylistPos(pos as usize));
                }
            }
            Some(Event::PropertyChange {
                name,
                data: message.data,
            })
        }
        Some(other) => Some(Event::Other(other.to_string())),
        None => {
            let request_id = message.request_id?;
            let error = message.error.filter(|e| e != "success");
            Some(Event::Reply { request_id, error })
        }
    }
}
