use std::io;
use std::path::Path;

use tokio::fs;

pub async fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).await?;
    }
    Ok(())
}

/// Move `src` into place at `dst`, replacing any existing file. Rename is
/// atomic on one filesystem; the copy fallback covers tmp roots mounted on
/// a different device.
pub async fn replace_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent).await?;
    }
    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst).await?;
            fs::remove_file(src).await
        }
    }
}
