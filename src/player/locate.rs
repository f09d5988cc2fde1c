//! Player binary lookup

use std::path::{Path, PathBuf};

use tracing::debug;

use super::PlayerError;

/// Environment variable naming an explicit player binary
pub const MPV_PATH_ENV: &str = "MPV_PATH";

const PATH_CANDIDATES: &[&str] = &["mpv", "mpvnet"];

/// Find the player binary.
///
/// Order: `explicit` (command line), `MPV_PATH`, `configured` (config file),
/// `mpv` then `mpvnet` on `PATH`, then common Windows install locations.
pub fn locate_player(
    explicit: Option<&Path>,
    configured: Option<&Path>,
) -> Result<PathBuf, PlayerError> {
    let from_env = std::env::var_os(MPV_PATH_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    locate_with(
        explicit,
        from_env.as_deref(),
        configured,
        std::env::var_os("PATH").as_deref(),
    )
}

fn locate_with(
    explicit: Option<&Path>,
    from_env: Option<&Path>,
    configured: Option<&Path>,
    search_path: Option<&std::ffi::OsStr>,
) -> Result<PathBuf, PlayerError> {
    // A path the user named wins even if it does not exist; spawning it reports the problem.
    if let Some(path) = explicit.or(from_env).or(configured) {
        debug!(path = %path.display(), "using configured player");
        return Ok(path.to_path_buf());
    }

    if let Some(search_path) = search_path {
        for name in PATH_CANDIDATES {
            if let Some(found) = search(name, search_path) {
                debug!(path = %found.display(), "found player on PATH");
                return Ok(found);
            }
        }
    }

    common_locations()
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| PlayerError::NotFound("mpv".to_string()))
}

fn search(name: &str, search_path: &std::ffi::OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_path)
        .flat_map(|dir| executable_names(name).map(move |file| dir.join(file)))
        .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn executable_names(name: &str) -> impl Iterator<Item = String> {
    [format!("{}.exe", name), name.to_string()].into_iter()
}

#[cfg(not(windows))]
fn executable_names(name: &str) -> impl Iterator<Item = String> {
    std::iter::once(name.to_string())
}

#[cfg(windows)]
fn common_locations() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = [
        r"C:\Program Files\mpv\mpv.exe",
        r"C:\Program Files (x86)\mpv\mpv.exe",
        r"C:\tools\mpv\mpv.exe",
        r"C:\ProgramData\chocolatey\lib\mpv\tools\mpv.exe",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    if let Some(home) = dirs::home_dir() {
        paths.extend([
            home.join(r"scoop\apps\mpv\current\mpv.exe"),
            home.join(r"scoop\shims\mpv.exe"),
            home.join(r"AppData\Local\Microsoft\WindowsApps\mpv.exe"),
            home.join(r"AppData\Local\Programs\mpv.net\mpvnet.exe"),
        ]);
    }
    paths
}

#[cfg(not(windows))]
fn common_locations() -> Vec<PathBuf> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn test_explicit_path_wins() {
        let found = locate_with(
            Some(Path::new("/opt/mpv/bin/mpv")),
            Some(Path::new("/env/mpv")),
            Some(Path::new("/config/mpv")),
            None,
        )
        .unwrap();
        assert_eq!(found, PathBuf::from("/opt/mpv/bin/mpv"));
    }

    #[test]
    fn test_env_before_config() {
        let found = locate_with(
            None,
            Some(Path::new("/env/mpv")),
            Some(Path::new("/config/mpv")),
            None,
        )
        .unwrap();
        assert_eq!(found, PathBuf::from("/env/mpv"));
    }

    #[cfg(unix)]
    #[test]
    fn test_searches_path_for_mpvnet_after_mpv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mpvnet"), b"").unwrap();
        let search_path = OsString::from(dir.path());
        let found = locate_with(None, None, None, Some(&search_path)).unwrap();
        assert_eq!(found, dir.path().join("mpvnet"));

        std::fs::write(dir.path().join("mpv"), b"").unwrap();
        let found = locate_with(None, None, None, Some(&search_path)).unwrap();
        assert_eq!(found, dir.path().join("mpv"));
    }

    #[cfg(unix)]
    #[test]
    fn test_not_found_mentions_env_var() {
        let dir = tempfile::tempdir().unwrap();
        let search_path = OsString::from(dir.path());
        let err = locate_with(None, None, None, Some(&search_path)).unwrap_err();
        assert!(matches!(err, PlayerError::NotFound(_)));
        assert!(err.to_string().contains(MPV_PATH_ENV));
    }
}
