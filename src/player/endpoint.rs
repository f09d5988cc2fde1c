//! Control endpoint
//!
//! A session-scoped Unix socket (or Windows named pipe) the player listens on.
//! The player creates it; we only dial, and remove leftovers before launch and
//! after the session ends.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

#[cfg(unix)]
pub type ControlStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type ControlStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Path or pipe name of one session's control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    path: PathBuf,
}

impl ControlEndpoint {
    /// Fresh endpoint name unique to this process and session
    pub fn for_session() -> Self {
        let name = format!(
            "memstream-mpv-{}-{}",
            std::process::id(),
            Uuid::new_v4().simple()
        );
        Self::at(Self::base_dir().join(name + Self::SUFFIX))
    }

    /// Endpoint at an explicit location
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(unix)]
    const SUFFIX: &'static str = ".sock";
    #[cfg(windows)]
    const SUFFIX: &'static str = "";

    #[cfg(unix)]
    fn base_dir() -> PathBuf {
        std::env::temp_dir()
    }

    #[cfg(windows)]
    fn base_dir() -> PathBuf {
        PathBuf::from(r"\\.\pipe")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value for `--input-ipc-server=`
    pub fn as_arg(&self) -> String {
        self.path.display().to_string()
    }

    #[cfg(unix)]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    #[cfg(windows)]
    pub fn exists(&self) -> bool {
        tokio::net::windows::named_pipe::ClientOptions::new()
            .open(&self.path)
            .is_ok()
    }

    #[cfg(unix)]
    pub async fn dial(&self) -> io::Result<ControlStream> {
        tokio::net::UnixStream::connect(&self.path).await
    }

    #[cfg(windows)]
    pub async fn dial(&self) -> io::Result<ControlStream> {
        tokio::net::windows::named_pipe::ClientOptions::new().open(&self.path)
    }

    /// Remove a stale socket left by a crashed session.
    pub fn pre_clean(&self) {
        self.remove("stale");
    }

    /// Remove the socket after the session ended.
    pub fn post_clean(&self) {
        self.remove("session");
    }

    #[cfg(unix)]
    fn remove(&self, what: &str) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed {} control socket", what),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove control socket: {}", e),
        }
    }

    // Pipes vanish with their last handle
    #[cfg(windows)]
    fn remove(&self, _what: &str) {}
}

impl std::fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_session_endpoints_are_unique() {
        let a = ControlEndpoint::for_session();
        let b = ControlEndpoint::for_session();
        assert_ne!(a, b);
        let name = a.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("memstream-mpv-{}-", std::process::id())));
        assert!(name.ends_with(".sock"));
    }

    #[test]
    fn test_clean_removes_leftover_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = ControlEndpoint::at(dir.path().join("old.sock"));
        std::fs::write(endpoint.path(), b"").unwrap();
        assert!(endpoint.exists());
        endpoint.pre_clean();
        assert!(!endpoint.exists());
        endpoint.post_clean();
    }

    #[tokio::test]
    async fn test_dial_missing_endpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = ControlEndpoint::at(dir.path().join("none.sock"));
        assert!(endpoint.dial().await.is_err());
    }
}
