use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use credmux_common::{Clock, UnixSeconds};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ProviderError, ProviderResult};

/// The on-disk shape of an OAuth-refreshed credential (spec.md §6
/// "Persisted state"). Opaque to everything except the owning plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredentialFile {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: UnixSeconds,
    pub endpoint: Option<String>,
    pub token_endpoint: Option<String>,
}

/// Per-path cache entry. `refresh_lock` is the coalescing point: whichever
/// caller reaches it first performs the network refresh; everyone else
/// queues behind the lock and, on acquiring it, finds the token already
/// fresh and does nothing.
struct Slot {
    cached: Mutex<Option<OAuthCredentialFile>>,
    refresh_lock: Mutex<()>,
}

/// Loads, memoizes, and refreshes OAuth credential files, keyed by their
/// absolute path (spec.md §4.D). One store is shared by every OAuth-backed
/// plugin in the process.
pub struct OAuthStore {
    clock: Arc<dyn Clock>,
    skew_seconds: i64,
    http: wreq::Client,
    slots: Mutex<HashMap<PathBuf, Arc<Slot>>>,
}

impl OAuthStore {
    pub fn new(clock: Arc<dyn Clock>, skew_seconds: i64, http: wreq::Client) -> Self {
        Self {
            clock,
            skew_seconds,
            http,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot_for(&self, path: &Path) -> Arc<Slot> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                Arc::new(Slot {
                    cached: Mutex::new(None),
                    refresh_lock: Mutex::new(()),
                })
            })
            .clone()
    }

    /// Returns a usable access token for `path`, loading the file on first
    /// use and refreshing it first if it is within `skew_seconds` of expiry.
    pub async fn access_token(&self, path: &Path) -> ProviderResult<String> {
        let slot = self.slot_for(path).await;
        self.ensure_loaded(path, &slot).await?;
        self.ensure_fresh(path, &slot).await?;
        let cached = slot.cached.lock().await;
        Ok(cached.as_ref().expect("loaded above").access_token.clone())
    }

    /// Returns the endpoint carried in the credential blob, if any
    /// (spec.md §4.D "Endpoint discovery").
    pub async fn endpoint(&self, path: &Path) -> ProviderResult<Option<String>> {
        let slot = self.slot_for(path).await;
        self.ensure_loaded(path, &slot).await?;
        Ok(slot.cached.lock().await.as_ref().and_then(|c| c.endpoint.clone()))
    }

    /// Forces a single refresh regardless of the cached expiry, then
    /// returns the new token. Called by a plugin on an `auth` failure
    /// (spec.md §4.D.3) so the caller can retry exactly once.
    pub async fn force_refresh(&self, path: &Path) -> ProviderResult<String> {
        let slot = self.slot_for(path).await;
        self.ensure_loaded(path, &slot).await?;
        let _guard = slot.refresh_lock.lock().await;
        let refreshed = self.do_refresh(path, &slot).await?;
        let token = refreshed.access_token.clone();
        *slot.cached.lock().await = Some(refreshed);
        Ok(token)
    }

    async fn ensure_loaded(&self, path: &Path, slot: &Slot) -> ProviderResult<()> {
        if slot.cached.lock().await.is_some() {
            return Ok(());
        }
        let loaded = load_locked(path).await?;
        *slot.cached.lock().await = Some(loaded);
        Ok(())
    }

    async fn ensure_fresh(&self, path: &Path, slot: &Slot) -> ProviderResult<()> {
        if !self.needs_refresh(slot).await {
            return Ok(());
        }
        let _guard = slot.refresh_lock.lock().await;
        // Re-check: another caller may have refreshed while we waited on
        // refresh_lock, in which case this is a no-op.
        if !self.needs_refresh(slot).await {
            return Ok(());
        }
        let refreshed = self.do_refresh(path, slot).await?;
        *slot.cached.lock().await = Some(refreshed);
        Ok(())
    }

    async fn needs_refresh(&self, slot: &Slot) -> bool {
        let now = self.clock.now_unix();
        match slot.cached.lock().await.as_ref() {
            Some(cached) => now + self.skew_seconds >= cached.expires_at,
            None => true,
        }
    }

    async fn do_refresh(&self, path: &Path, slot: &Slot) -> ProviderResult<OAuthCredentialFile> {
        let current = slot
            .cached
            .lock()
            .await
            .clone()
            .ok_or(ProviderError::MissingCredentialField("oauth credential not loaded"))?;
        let Some(token_endpoint) = current.token_endpoint.clone() else {
            return Err(ProviderError::InvalidConfig(
                "oauth credential has no token_endpoint".to_string(),
            ));
        };

        let response = self
            .http
            .post(&token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", current.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|err| ProviderError::OAuthRefreshFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::OAuthRefreshFailed(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: Option<String>,
            expires_in: i64,
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::OAuthRefreshFailed(err.to_string()))?;

        let refreshed = OAuthCredentialFile {
            access_token: body.access_token,
            refresh_token: body.refresh_token.unwrap_or(current.refresh_token),
            expires_at: self.clock.now_unix() + body.expires_in,
            endpoint: current.endpoint,
            token_endpoint: Some(token_endpoint),
        };

        write_locked(path, &refreshed).await?;
        tracing::debug!(path = %path.display(), "refreshed oauth credential");
        Ok(refreshed)
    }
}

async fn load_locked(path: &Path) -> ProviderResult<OAuthCredentialFile> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use fs2::FileExt;
        let file = std::fs::File::open(&path)
            .map_err(|err| ProviderError::InvalidConfig(format!("{}: {err}", path.display())))?;
        file.lock_shared()
            .map_err(|err| ProviderError::InvalidConfig(format!("{}: {err}", path.display())))?;
        let contents = std::fs::read_to_string(&path)
            .map_err(|err| ProviderError::InvalidConfig(format!("{}: {err}", path.display())))?;
        fs2::FileExt::unlock(&file).ok();
        serde_json::from_str(&contents)
            .map_err(|err| ProviderError::InvalidConfig(format!("{}: {err}", path.display())))
    })
    .await
    .map_err(|err| ProviderError::InvalidConfig(err.to_string()))?
}

/// Atomic temp+rename write, guarded by an exclusive file lock on the
/// destination (same discipline as `credmux-ledger`'s persistence module).
async fn write_locked(path: &Path, credential: &OAuthCredentialFile) -> ProviderResult<()> {
    let path = path.to_path_buf();
    let payload = serde_json::to_vec_pretty(credential)
        .map_err(|err| ProviderError::InvalidConfig(err.to_string()))?;
    tokio::task::spawn_blocking(move || {
        use fs2::FileExt;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &payload)
            .map_err(|err| ProviderError::InvalidConfig(format!("{}: {err}", tmp_path.display())))?;
        let lock_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| ProviderError::InvalidConfig(format!("{}: {err}", path.display())))?;
        lock_file
            .lock_exclusive()
            .map_err(|err| ProviderError::InvalidConfig(format!("{}: {err}", path.display())))?;
        std::fs::rename(&tmp_path, &path)
            .map_err(|err| ProviderError::InvalidConfig(format!("{}: {err}", path.display())))?;
        fs2::FileExt::unlock(&lock_file).ok();
        Ok(())
    })
    .await
    .map_err(|err| ProviderError::InvalidConfig(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use credmux_common::FixedClock;
    use std::io::Write;

    fn write_fixture(dir: &tempfile::TempDir, expires_at: i64) -> PathBuf {
        let path = dir.path().join("cred.json");
        let mut file = std::fs::File::create(&path).unwrap();
        let contents = serde_json::to_string(&OAuthCredentialFile {
            access_token: "stale".to_string(),
            refresh_token: "refresh-me".to_string(),
            expires_at,
            endpoint: Some("https://api.example.com".to_string()),
            token_endpoint: Some("https://auth.example.com/token".to_string()),
        })
        .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn fresh_token_skips_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, 1_700_010_000);
        let clock = Arc::new(FixedClock::new(1_700_000_000));
        let store = OAuthStore::new(clock, 120, wreq::Client::new());

        let token = store.access_token(&path).await.unwrap();
        assert_eq!(token, "stale");
    }
}
