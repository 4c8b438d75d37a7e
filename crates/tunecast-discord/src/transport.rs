// # IPC Transport
//
// Discord listens on `discord-ipc-0` .. `discord-ipc-9`: unix sockets under
// the runtime/temp directory (plus the flatpak and snap sandboxes), or named
// pipes on Windows.

use std::io;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

/// Number of IPC endpoints a client may find Discord on
pub const IPC_SLOTS: usize = 10;

/// A connected IPC stream
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> IpcStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

/// Endpoints to try, in order
#[cfg(unix)]
pub fn candidate_paths() -> Vec<PathBuf> {
    let base = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"]
        .iter()
        .find_map(|var| std::env::var_os(var).filter(|v| !v.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));

    ["", "app/com.discordapp.Discord", "snap.discord"]
        .iter()
        .flat_map(|sandbox| {
            let dir = base.join(sandbox);
            (0..IPC_SLOTS).map(move |i| dir.join(format!("discord-ipc-{}", i)))
        })
        .collect()
}

/// Endpoints to try, in order
#[cfg(windows)]
pub fn candidate_paths() -> Vec<PathBuf> {
    (0..IPC_SLOTS)
        .map(|i| PathBuf::from(format!(r"\\?\pipe\discord-ipc-{}", i)))
        .collect()
}

#[cfg(unix)]
pub async fn open(path: &std::path::Path) -> io::Result<Box<dyn IpcStream>> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
pub async fn open(path: &std::path::Path) -> io::Result<Box<dyn IpcStream>> {
    let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
    Ok(Box::new(pipe))
}
