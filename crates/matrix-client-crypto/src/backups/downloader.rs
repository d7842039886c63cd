// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use http::Method;
use matrix_client_common::{
    executor::{spawn, AbortOnDrop, JoinHandleExt},
    failures_cache::FailuresCache,
    sleep::sleep,
};
use ruma::{OwnedRoomId, RoomId};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, trace, warn};

use super::{
    BackupDecryptor, BackupEvent, BackupManager, KeyBackupSession, MEGOLM_BACKUP_V1_ALGORITHM,
};
use crate::{
    backend::CryptoBackend,
    http_client::{encode_path_segment, HttpClient, HttpError, RequestOptions},
};

/// Timings of the [`PerSessionKeyBackupDownloader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackupDownloaderSettings {
    /// How long the download loop pauses after a network error, or after a
    /// rate-limit response without a `retry_after_ms`.
    pub max_time_between_retry: Duration,
    /// How long we don't ask the server again for a key it doesn't have.
    pub backoff_for_missing_key: Duration,
}

impl Default for BackupDownloaderSettings {
    fn default() -> Self {
        Self {
            max_time_between_retry: Duration::from_millis(5000),
            backoff_for_missing_key: Duration::from_millis(5000),
        }
    }
}

/// Why the current backup can't be used to download keys.
///
/// These don't go away by retrying, the downloader waits for a change of the
/// backup status before trying again.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigurationProblem {
    /// The backup info couldn't be fetched from the server.
    #[error("the backup info couldn't be fetched: {0}")]
    ServerBackupInfo(String),
    /// There's no backup on the server.
    #[error("there's no backup on the server")]
    NoBackup,
    /// The server backup uses an algorithm we don't support.
    #[error("the backup algorithm {0} isn't supported")]
    UnsupportedAlgorithm(String),
    /// The version on the server isn't the one we trust.
    #[error("the server backup version {server} isn't the active version {active:?}")]
    ActiveVersionMismatch {
        /// The version on the server.
        server: String,
        /// The version we trust.
        active: Option<String>,
    },
    /// We don't have the private key of the backup.
    #[error("the backup decryption key is missing")]
    NoDecryptionKey,
    /// The private key we have belongs to a different backup version.
    #[error("the backup decryption key belongs to the version {key_version:?}, not {server}")]
    KeyVersionMismatch {
        /// The version on the server.
        server: String,
        /// The version the key was stored for.
        key_version: Option<String>,
    },
    /// The private key doesn't match the public key of the server backup.
    #[error("the backup decryption key doesn't match the public key of the backup")]
    PublicKeyMismatch,
}

/// The ways downloading a single room key can fail.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KeyDownloadError {
    /// The server doesn't have the key in its backup.
    #[error("the room key is not in the backup")]
    MissingDecryptionKey,
    /// The server couldn't be reached, or failed to reply.
    #[error("network error while downloading the room key")]
    NetworkError,
    /// The server asked us to slow down.
    #[error("rate limited while downloading the room key")]
    RateLimited {
        /// How long the server wants us to wait.
        retry_after: Option<Duration>,
    },
    /// The downloader was stopped.
    #[error("the key downloader has been stopped")]
    Stopped,
    /// The backup can't be used right now.
    #[error(transparent)]
    Configuration(#[from] ConfigurationProblem),
}

impl From<HttpError> for KeyDownloadError {
    fn from(error: HttpError) -> Self {
        match error {
            HttpError::Matrix(e) if e.is_not_found() => Self::MissingDecryptionKey,
            HttpError::Matrix(e) if e.is_rate_limited() => {
                Self::RateLimited { retry_after: e.retry_after() }
            }
            // A malformed key won't get better by asking again right away.
            HttpError::Json(_) => Self::MissingDecryptionKey,
            HttpError::Matrix(_) | HttpError::Connection(_) => Self::NetworkError,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SessionInfo {
    room_id: OwnedRoomId,
    session_id: String,
}

#[derive(Clone, Debug)]
struct Configuration {
    backup_version: String,
    decryptor: BackupDecryptor,
}

#[derive(Debug, Default)]
struct DownloaderState {
    queue: VecDeque<SessionInfo>,
    loop_running: bool,
    configuration: Option<Configuration>,
    has_configuration_problem: bool,
    /// Bumped on every backup status change, a configuration computed under
    /// an older generation is thrown away.
    configuration_generation: u64,
}

#[derive(Debug)]
struct DownloaderInner {
    backend: Arc<dyn CryptoBackend>,
    http: Arc<dyn HttpClient>,
    backup_manager: Arc<BackupManager>,
    settings: BackupDownloaderSettings,
    state: Mutex<DownloaderState>,
    sessions_checked: FailuresCache<SessionInfo>,
    stop_sender: watch::Sender<bool>,
}

/// Downloads single room keys from the key backup, on demand.
///
/// Whenever an event fails to decrypt because its room key is missing, the
/// key is requested from the backup. Requests are queued and served one at a
/// time by a background loop. A key the server doesn't have isn't requested
/// again for a while.
#[derive(Debug)]
pub struct PerSessionKeyBackupDownloader {
    inner: Arc<DownloaderInner>,
    _status_listener: AbortOnDrop<()>,
}

impl PerSessionKeyBackupDownloader {
    /// Create a new downloader with the default settings.
    ///
    /// Needs to be called inside a tokio runtime, a task listening to backup
    /// status changes is spawned.
    pub fn new(
        backend: Arc<dyn CryptoBackend>,
        http: Arc<dyn HttpClient>,
        backup_manager: Arc<BackupManager>,
    ) -> Self {
        Self::with_settings(backend, http, backup_manager, BackupDownloaderSettings::default())
    }

    /// Create a new downloader with custom timings.
    pub fn with_settings(
        backend: Arc<dyn CryptoBackend>,
        http: Arc<dyn HttpClient>,
        backup_manager: Arc<BackupManager>,
        settings: BackupDownloaderSettings,
    ) -> Self {
        let (stop_sender, _) = watch::channel(false);
        let events = backup_manager.subscribe();

        let inner = Arc::new(DownloaderInner {
            backend,
            http,
            backup_manager,
            sessions_checked: FailuresCache::with_fixed_backoff(settings.backoff_for_missing_key),
            settings,
            state: Default::default(),
            stop_sender,
        });

        let status_listener =
            spawn(listen_for_status_changes(inner.clone(), events)).abort_on_drop();

        Self { inner, _status_listener: status_listener }
    }

    /// Queue a download for a room key, called when an event couldn't be
    /// decrypted because the key is missing.
    ///
    /// The request is dropped if the same key is already queued, or if the
    /// server recently told us it doesn't have it.
    pub fn on_decryption_key_missing_error(&self, room_id: &RoomId, session_id: &str) {
        self.inner.on_decryption_key_missing_error(room_id, session_id);
    }

    /// Re-validate the backup configuration and resume the queue, called when
    /// the backup status changed.
    pub fn on_backup_status_changed(&self) {
        self.inner.on_backup_status_changed();
    }

    /// Is the background loop currently draining the queue.
    pub fn is_download_loop_running(&self) -> bool {
        self.inner.state.lock().unwrap().loop_running
    }

    /// The number of queued downloads.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Stop the downloader, queued and in-flight downloads are abandoned.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

impl Drop for PerSessionKeyBackupDownloader {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

async fn listen_for_status_changes(
    inner: Arc<DownloaderInner>,
    mut events: broadcast::Receiver<BackupEvent>,
) {
    loop {
        match events.recv().await {
            Ok(BackupEvent::KeyBackupStatusChanged { .. } | BackupEvent::DecryptionKeyCached) => {
                inner.on_backup_status_changed();
            }
            Ok(BackupEvent::RoomKeysImported { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => inner.on_backup_status_changed(),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl DownloaderInner {
    fn is_stopped(&self) -> bool {
        *self.stop_sender.borrow()
    }

    fn stop(&self) {
        self.stop_sender.send_replace(true);
        self.state.lock().unwrap().queue.clear();
    }

    fn on_decryption_key_missing_error(self: &Arc<Self>, room_id: &RoomId, session_id: &str) {
        if self.is_stopped() {
            return;
        }

        let info = SessionInfo { room_id: room_id.to_owned(), session_id: session_id.to_owned() };

        if self.sessions_checked.contains(&info) {
            trace!(%room_id, session_id, "The key was recently checked and isn't in the backup");
            return;
        }

        let mut state = self.state.lock().unwrap();

        if state.queue.contains(&info) {
            trace!(%room_id, session_id, "The key is already queued for download");
            return;
        }

        debug!(%room_id, session_id, "Queueing a room key download from the backup");
        state.queue.push_back(info);
        self.start_loop_if_needed(&mut state);
    }

    fn on_backup_status_changed(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();

        state.configuration = None;
        state.has_configuration_problem = false;
        state.configuration_generation += 1;

        if !state.queue.is_empty() {
            debug!("The backup status changed, resuming the key downloads");
            self.start_loop_if_needed(&mut state);
        }
    }

    fn start_loop_if_needed(self: &Arc<Self>, state: &mut DownloaderState) {
        if state.loop_running || state.has_configuration_problem || self.is_stopped() {
            return;
        }

        state.loop_running = true;
        // The task exits on its own once the queue is empty or on stop.
        let _ = spawn(download_loop(self.clone()));
    }

    /// Run the future unless the downloader gets stopped first.
    async fn or_stopped<T>(&self, future: impl Future<Output = T>) -> Result<T, KeyDownloadError> {
        let mut stopped = self.stop_sender.subscribe();

        tokio::select! {
            biased;
            _ = stopped.wait_for(|stopped| *stopped) => Err(KeyDownloadError::Stopped),
            result = future => Ok(result),
        }
    }

    /// Get the cached configuration, or validate the backup to create one.
    async fn configuration(&self) -> Result<Configuration, KeyDownloadError> {
        let generation = {
            let state = self.state.lock().unwrap();
            if let Some(configuration) = &state.configuration {
                return Ok(configuration.clone());
            }
            state.configuration_generation
        };

        let configuration = self.validate_configuration().await?;

        let mut state = self.state.lock().unwrap();
        if state.configuration_generation == generation {
            state.configuration = Some(configuration.clone());
        }

        Ok(configuration)
    }

    async fn validate_configuration(&self) -> Result<Configuration, KeyDownloadError> {
        let info = match self.or_stopped(self.backup_manager.request_key_backup_version()).await? {
            Ok(Some(info)) => info,
            Ok(None) => return Err(ConfigurationProblem::NoBackup.into()),
            Err(e @ HttpError::Connection(_)) => {
                warn!("Couldn't fetch the backup info: {e}");
                return Err(KeyDownloadError::NetworkError);
            }
            Err(HttpError::Matrix(e)) if e.is_rate_limited() => {
                return Err(KeyDownloadError::RateLimited { retry_after: e.retry_after() });
            }
            Err(e) => return Err(ConfigurationProblem::ServerBackupInfo(e.to_string()).into()),
        };

        if info.algorithm != MEGOLM_BACKUP_V1_ALGORITHM {
            return Err(ConfigurationProblem::UnsupportedAlgorithm(info.algorithm).into());
        }

        let Some(server_version) = info.version.clone() else {
            return Err(ConfigurationProblem::NoBackup.into());
        };

        let active = self.backup_manager.active_backup_version();
        if active.as_deref() != Some(server_version.as_str()) {
            let problem =
                ConfigurationProblem::ActiveVersionMismatch { server: server_version, active };
            return Err(problem.into());
        }

        let keys = self.backend.backup_keys().await.map_err(|e| {
            warn!("Couldn't load the backup keys: {e}");
            ConfigurationProblem::NoDecryptionKey
        })?;

        let Some(key) = keys.decryption_key else {
            return Err(ConfigurationProblem::NoDecryptionKey.into());
        };

        if keys.backup_version.as_deref() != Some(server_version.as_str()) {
            return Err(ConfigurationProblem::KeyVersionMismatch {
                server: server_version,
                key_version: keys.backup_version,
            }
            .into());
        }

        let decryptor = BackupDecryptor::new(key);
        if info.megolm_v1_public_key() != Some(decryptor.public_key().as_str()) {
            return Err(ConfigurationProblem::PublicKeyMismatch.into());
        }

        Ok(Configuration { backup_version: server_version, decryptor })
    }

    #[instrument(skip(self), fields(room_id = %request.room_id, session_id = %request.session_id))]
    async fn process_request(&self, request: &SessionInfo) -> Result<(), KeyDownloadError> {
        if self.is_stopped() {
            return Err(KeyDownloadError::Stopped);
        }

        let configuration = self.configuration().await?;

        let path = format!(
            "/room_keys/keys/{}/{}",
            encode_path_segment(request.room_id.as_str()),
            encode_path_segment(&request.session_id)
        );
        let response = self
            .or_stopped(self.http.authed_request(
                Method::GET,
                &path,
                &[("version", configuration.backup_version.as_str())],
                None,
                RequestOptions::default(),
            ))
            .await??;

        let session: KeyBackupSession =
            serde_json::from_value(response).map_err(|_| KeyDownloadError::MissingDecryptionKey)?;

        // Don't bother importing if we were stopped while the request was in
        // flight.
        if self.is_stopped() {
            return Err(KeyDownloadError::Stopped);
        }

        let keys = configuration.decryptor.decrypt_sessions(
            &request.room_id,
            BTreeMap::from([(request.session_id.clone(), session)]),
        );

        if keys.is_empty() {
            warn!("The downloaded room key couldn't be decrypted");
            return Ok(());
        }

        let version = &configuration.backup_version;
        match self.backup_manager.import_backed_up_room_keys(keys, version).await {
            Ok(result) => {
                info!(imported = result.imported_count, "Imported a room key from the backup")
            }
            Err(e) => warn!("Failed to import the downloaded room key: {e}"),
        }

        Ok(())
    }
}

async fn download_loop(inner: Arc<DownloaderInner>) {
    loop {
        let request = {
            let mut state = inner.state.lock().unwrap();
            match state.queue.front().cloned() {
                Some(request) if !inner.is_stopped() => request,
                _ => {
                    state.loop_running = false;
                    return;
                }
            }
        };

        let generation = inner.state.lock().unwrap().configuration_generation;
        let result = inner.process_request(&request).await;

        match result {
            Ok(()) => {
                inner.state.lock().unwrap().queue.pop_front();
            }
            Err(KeyDownloadError::MissingDecryptionKey) => {
                debug!(
                    room_id = %request.room_id,
                    session_id = %request.session_id,
                    "The room key isn't in the backup"
                );
                inner.sessions_checked.insert(request);
                inner.state.lock().unwrap().queue.pop_front();
            }
            Err(KeyDownloadError::NetworkError) => {
                debug!("Network error, pausing the key downloads");
                if inner.or_stopped(sleep(inner.settings.max_time_between_retry)).await.is_err() {
                    break;
                }
            }
            Err(KeyDownloadError::RateLimited { retry_after }) => {
                let delay = retry_after.unwrap_or(inner.settings.max_time_between_retry);
                debug!(?delay, "Rate limited, pausing the key downloads");
                if inner.or_stopped(sleep(delay)).await.is_err() {
                    break;
                }
            }
            Err(KeyDownloadError::Stopped) => break,
            Err(KeyDownloadError::Configuration(problem)) => {
                let mut state = inner.state.lock().unwrap();

                // The status changed while we were validating, the problem
                // may be gone already.
                if state.configuration_generation != generation {
                    debug!("Backup status changed during validation, trying again: {problem}");
                    continue;
                }

                info!("Can't download room keys from the backup: {problem}");
                state.has_configuration_problem = true;
                state.loop_running = false;
                return;
            }
        }
    }

    inner.state.lock().unwrap().loop_running = false;
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use http::{Method, StatusCode};
    use ruma::room_id;
    use serde_json::{json, Value as JsonValue};

    use super::{BackupDownloaderSettings, PerSessionKeyBackupDownloader};
    use crate::{
        backups::BackupManager,
        http_client::{HttpError, MatrixError},
        testing::{backup_info_json, FakeBackend, FakeBackupKey, FakeHttp},
    };

    fn not_found() -> HttpError {
        HttpError::Matrix(MatrixError::from_response(
            StatusCode::NOT_FOUND,
            &json!({ "errcode": "M_NOT_FOUND", "error": "No room_keys found" }),
        ))
    }

    fn backed_up_key() -> JsonValue {
        json!({
            "first_message_index": 0,
            "forwarded_count": 0,
            "is_verified": true,
            "session_data": {
                "plain": {
                    "algorithm": "m.megolm.v1.aes-sha2",
                    "sender_key": "sender",
                    "session_key": "key",
                }
            }
        })
    }

    fn trusted_backend() -> Arc<FakeBackend> {
        let backend = Arc::new(FakeBackend::default());
        backend.set_backup_trusted(true);
        backend.set_backup_keys(Some(Arc::new(FakeBackupKey::new("pubkey"))), Some("1"));
        backend
    }

    async fn setup(
        backend: Arc<FakeBackend>,
        key_handler: impl Fn() -> Result<JsonValue, HttpError> + Send + Sync + 'static,
    ) -> (PerSessionKeyBackupDownloader, Arc<BackupManager>, Arc<FakeHttp>) {
        setup_with_server(backend, move |path: &str| {
            if path == "/room_keys/version" {
                Ok(backup_info_json("1", "pubkey"))
            } else {
                key_handler()
            }
        })
        .await
    }

    async fn setup_with_server(
        backend: Arc<FakeBackend>,
        handler: impl Fn(&str) -> Result<JsonValue, HttpError> + Send + Sync + 'static,
    ) -> (PerSessionKeyBackupDownloader, Arc<BackupManager>, Arc<FakeHttp>) {
        let http = Arc::new(FakeHttp::new(move |_: &Method, path: &str| handler(path)));

        let manager = Arc::new(BackupManager::new(backend.clone(), http.clone()));
        manager.check_key_backup_and_enable().await.unwrap();

        let downloader = PerSessionKeyBackupDownloader::new(backend, http.clone(), manager.clone());
        (downloader, manager, http)
    }

    fn key_requests(http: &FakeHttp) -> usize {
        http.requests().iter().filter(|r| r.path.starts_with("/room_keys/keys/")).count()
    }

    fn version_requests(http: &FakeHttp) -> usize {
        http.requests().iter().filter(|r| r.path == "/room_keys/version").count()
    }

    async fn wait_for_idle(downloader: &PerSessionKeyBackupDownloader) {
        while downloader.is_download_loop_running() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_key_is_not_requested_again_within_the_backoff() {
        let (downloader, _manager, http) = setup(trusted_backend(), || Err(not_found())).await;
        let room_id = room_id!("!room:localhost");

        downloader.on_decryption_key_missing_error(room_id, "session");
        wait_for_idle(&downloader).await;
        assert_eq!(key_requests(&http), 1);

        downloader.on_decryption_key_missing_error(room_id, "session");
        wait_for_idle(&downloader).await;
        assert_eq!(key_requests(&http), 1);

        tokio::time::advance(Duration::from_millis(4999)).await;
        downloader.on_decryption_key_missing_error(room_id, "session");
        wait_for_idle(&downloader).await;
        assert_eq!(key_requests(&http), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        downloader.on_decryption_key_missing_error(room_id, "session");
        wait_for_idle(&downloader).await;
        assert_eq!(key_requests(&http), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_downloaded_key_is_imported() {
        let backend = trusted_backend();
        let (downloader, _manager, http) = setup(backend.clone(), || Ok(backed_up_key())).await;

        downloader.on_decryption_key_missing_error(room_id!("!room:localhost"), "session");
        wait_for_idle(&downloader).await;

        let imported = backend.imported_keys();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].0.session_id, "session");
        assert_eq!(imported[0].1, "1");

        let request = http.requests().into_iter().last().unwrap();
        assert_eq!(request.path, "/room_keys/keys/%21room%3Alocalhost/session");
        assert_eq!(request.query, vec![("version".to_owned(), "1".to_owned())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_requests_are_coalesced() {
        let (downloader, _manager, http) = setup(trusted_backend(), || Ok(backed_up_key())).await;
        let room_id = room_id!("!room:localhost");

        downloader.on_decryption_key_missing_error(room_id, "a");
        downloader.on_decryption_key_missing_error(room_id, "a");
        downloader.on_decryption_key_missing_error(room_id, "b");
        assert_eq!(downloader.queue_len(), 2);

        wait_for_idle(&downloader).await;
        assert_eq!(key_requests(&http), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_pause_the_loop_and_keep_the_request() {
        let online = Arc::new(AtomicBool::new(false));
        let backend = trusted_backend();
        let (downloader, _manager, http) = setup(backend.clone(), {
            let online = online.clone();
            move || {
                if online.load(Ordering::SeqCst) {
                    Ok(backed_up_key())
                } else {
                    Err(HttpError::Connection("offline".to_owned()))
                }
            }
        })
        .await;

        downloader.on_decryption_key_missing_error(room_id!("!room:localhost"), "session");
        while key_requests(&http) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(downloader.is_download_loop_running());
        assert_eq!(downloader.queue_len(), 1);

        online.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5001)).await;
        wait_for_idle(&downloader).await;

        assert_eq!(key_requests(&http), 2);
        assert_eq!(downloader.queue_len(), 0);
        assert_eq!(backend.imported_keys().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_uses_the_server_delay() {
        let limited = Arc::new(AtomicBool::new(true));
        let (downloader, _manager, http) = setup(trusted_backend(), {
            let limited = limited.clone();
            move || {
                if limited.swap(false, Ordering::SeqCst) {
                    Err(HttpError::Matrix(MatrixError::from_response(
                        StatusCode::TOO_MANY_REQUESTS,
                        &json!({ "errcode": "M_LIMIT_EXCEEDED", "retry_after_ms": 100 }),
                    )))
                } else {
                    Ok(backed_up_key())
                }
            }
        })
        .await;

        downloader.on_decryption_key_missing_error(room_id!("!room:localhost"), "session");
        tokio::time::sleep(Duration::from_millis(101)).await;
        wait_for_idle(&downloader).await;

        assert_eq!(key_requests(&http), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_problems_keep_the_queue_until_the_status_changes() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_backup_trusted(true);
        // The key belongs to an older backup.
        backend.set_backup_keys(Some(Arc::new(FakeBackupKey::new("pubkey"))), Some("0"));
        let (downloader, _manager, http) = setup(backend.clone(), || Ok(backed_up_key())).await;

        downloader.on_decryption_key_missing_error(room_id!("!room:localhost"), "session");
        wait_for_idle(&downloader).await;
        assert_eq!(key_requests(&http), 0);
        assert_eq!(downloader.queue_len(), 1);

        // New requests don't restart the loop while the problem persists.
        downloader.on_decryption_key_missing_error(room_id!("!room:localhost"), "other");
        wait_for_idle(&downloader).await;
        assert_eq!(key_requests(&http), 0);

        backend.set_backup_keys(Some(Arc::new(FakeBackupKey::new("pubkey"))), Some("1"));
        downloader.on_backup_status_changed();
        wait_for_idle(&downloader).await;

        assert_eq!(key_requests(&http), 2);
        assert_eq!(downloader.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_change_during_validation_doesnt_stall_the_queue() {
        let version_lookups = Arc::new(AtomicUsize::new(0));
        let (downloader, _manager, http) = setup_with_server(trusted_backend(), {
            let version_lookups = version_lookups.clone();
            move |path: &str| {
                if path != "/room_keys/version" {
                    return Ok(backed_up_key());
                }
                // The first lookup of the download loop sees a backup we
                // don't trust yet, the status change fixes that.
                if version_lookups.fetch_add(1, Ordering::SeqCst) == 1 {
                    Ok(backup_info_json("2", "pubkey"))
                } else {
                    Ok(backup_info_json("1", "pubkey"))
                }
            }
        })
        .await;
        http.set_delay(Some(Duration::from_millis(100)));

        downloader.on_decryption_key_missing_error(room_id!("!room:localhost"), "session");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(downloader.is_download_loop_running());
        downloader.on_backup_status_changed();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        wait_for_idle(&downloader).await;

        assert_eq!(version_requests(&http), 3);
        assert_eq!(key_requests(&http), 1);
        assert_eq!(downloader.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_from_before_a_status_change_isnt_cached() {
        let (downloader, _manager, http) = setup(trusted_backend(), || Ok(backed_up_key())).await;
        http.set_delay(Some(Duration::from_millis(100)));
        let room_id = room_id!("!room:localhost");

        downloader.on_decryption_key_missing_error(room_id, "a");
        downloader.on_decryption_key_missing_error(room_id, "b");
        tokio::time::sleep(Duration::from_millis(50)).await;
        downloader.on_backup_status_changed();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        wait_for_idle(&downloader).await;

        // The configuration used for "a" was validated under the old status,
        // "b" had to validate again.
        assert_eq!(version_requests(&http), 3);
        assert_eq!(key_requests(&http), 2);

        // Nothing changed since, the configuration is reused.
        downloader.on_decryption_key_missing_error(room_id, "c");
        tokio::time::sleep(Duration::from_millis(1000)).await;
        wait_for_idle(&downloader).await;

        assert_eq!(version_requests(&http), 3);
        assert_eq!(key_requests(&http), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatching_public_key_is_a_configuration_problem() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_backup_trusted(true);
        backend.set_backup_keys(Some(Arc::new(FakeBackupKey::new("other_key"))), Some("1"));
        let (downloader, _manager, http) = setup(backend, || Ok(backed_up_key())).await;

        downloader.on_decryption_key_missing_error(room_id!("!room:localhost"), "session");
        wait_for_idle(&downloader).await;

        assert_eq!(key_requests(&http), 0);
        assert_eq!(downloader.queue_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_abandons_queued_work() {
        let (downloader, _manager, http) =
            setup(trusted_backend(), || Err(HttpError::Connection("offline".to_owned()))).await;

        downloader.on_decryption_key_missing_error(room_id!("!room:localhost"), "session");
        while key_requests(&http) == 0 {
            tokio::task::yield_now().await;
        }

        downloader.stop();
        wait_for_idle(&downloader).await;
        assert_eq!(downloader.queue_len(), 0);

        downloader.on_decryption_key_missing_error(room_id!("!room:localhost"), "session");
        assert_eq!(downloader.queue_len(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(key_requests(&http), 1);
    }

    #[test]
    fn test_default_settings() {
        let settings = BackupDownloaderSettings::default();
        assert_eq!(settings.backoff_for_missing_key, Duration::from_millis(5000));
        assert_eq!(settings.max_time_between_retry, Duration::from_millis(5000));
    }
}
