use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::entry::LedgerEntry;

/// Serializes every `save` call within this process. `fs2`'s exclusive lock
/// below only guards against other processes; two tasks in this process
/// racing on the same path still need this so the temp-write-then-rename
/// sequence never interleaves.
static WRITE_GATE: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Loads the ledger document from `path`. A missing or corrupted file is
/// treated as an empty ledger with a logged warning (spec.md §3
/// Lifecycles), never a hard startup failure.
pub async fn load(path: &Path) -> HashMap<String, LedgerEntry> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no existing ledger file, starting empty");
            return HashMap::new();
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read ledger file, starting empty");
            return HashMap::new();
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(map) => map,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ledger file is corrupt, starting empty");
            HashMap::new()
        }
    }
}

/// Atomically persists the ledger document: write to a temp file in the
/// same directory, fsync, then rename over the target, the whole sequence
/// held under an exclusive lock on the destination path (same discipline as
/// `credmux-provider::oauth`'s credential-file writer). The in-process
/// `WRITE_GATE` mutex serializes same-process callers; the `fs2` lock
/// additionally guards against another process writing the same path.
pub async fn save(path: &Path, state: &HashMap<String, LedgerEntry>) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(state)?;
    let path = path.to_path_buf();
    let tmp_path = temp_path_for(&path);

    let _gate = WRITE_GATE.lock().await;
    tokio::task::spawn_blocking(move || {
        use fs2::FileExt;
        let lock_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        lock_file.lock_exclusive()?;

        let result = (|| {
            std::fs::write(&tmp_path, &body)?;
            let tmp_file = std::fs::File::open(&tmp_path)?;
            tmp_file.sync_all()?;
            drop(tmp_file);
            std::fs::rename(&tmp_path, &path)
        })();

        fs2::FileExt::unlock(&lock_file).ok();
        result
    })
    .await
    .map_err(std::io::Error::other)?
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "ledger.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LedgerEntry;

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let mut state = HashMap::new();
        state.insert("k1".to_string(), LedgerEntry::new("2026-07-28".to_string()));
        save(&path, &state).await.unwrap();

        let loaded = load(&path).await;
        assert!(loaded.contains_key("k1"));
        assert!(!dir.path().join("ledger.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded = load(&path).await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let loaded = load(&path).await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn concurrent_saves_never_corrupt_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let mut a = HashMap::new();
        a.insert("a".to_string(), LedgerEntry::new("2026-07-28".to_string()));
        let mut b = HashMap::new();
        b.insert("b".to_string(), LedgerEntry::new("2026-07-28".to_string()));

        let (r1, r2) = tokio::join!(save(&path, &a), save(&path, &b));
        r1.unwrap();
        r2.unwrap();

        let loaded = load(&path).await;
        assert!(loaded.contains_key("a") || loaded.contains_key("b"));
        assert_eq!(loaded.len(), 1);
    }
}
