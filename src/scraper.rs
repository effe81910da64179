use crate::config::{self, ScanMode, Settings, Tuning};
use crate::control::Control;
use crate::discord::{self, Attachment, Cursor, Message};
use crate::http::{self, HttpRequest, Transport};
use crate::ledger::DownloadLedger;
use crate::paths::AppPaths;
use crate::proxy_pool::{FetchError, ProxyPool};
use crate::state::ScanState;
use crate::status::StatusSink;
use crate::{gallery, library, media, naming, proxies};
use crate::{EngineError, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub paths: AppPaths,
    pub settings: Settings,
    pub token: String,
    pub download_dir: PathBuf,
}

impl ScraperConfig {
    pub fn load(paths: AppPaths) -> Result<Self> {
        let settings = config::load_settings(&paths)?;
        let token = config::resolve_token(&paths)?.ok_or(EngineError::MissingToken)?;
        let download_dir = config::effective_download_dir(&paths, &settings);
        Ok(Self {
            paths,
            settings,
            token,
            download_dir,
        })
    }

    fn tuning(&self) -> &Tuning {
        &self.settings.tuning
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Saved,
    AlreadyHave,
    Cancelled,
}

/// Background polling worker.
///
/// Each cycle walks the configured channels in random order. A channel is
/// first polled for messages newer than its `after` cursor; `full_scan`
/// channels then page backwards from their `before` cursor until the start of
/// history is reached.
pub struct Scraper {
    config: ScraperConfig,
    transport: Arc<dyn Transport>,
    status: StatusSink,
    control: Arc<Control>,
    pool: ProxyPool,
    ledger: DownloadLedger,
    state: ScanState,
}

impl Scraper {
    pub fn new(config: ScraperConfig, transport: Arc<dyn Transport>, status: StatusSink) -> Result<Self> {
        config.paths.ensure_dirs()?;
        std::fs::create_dir_all(&config.download_dir)?;

        let tuning = config.tuning();
        let proxy_list = if config.settings.use_proxies {
            proxies::load_proxies(&config.paths.proxies_path())?
        } else {
            Vec::new()
        };
        let pool = ProxyPool::new(proxy_list, config.settings.use_proxies)
            .with_persist_path(config.paths.proxies_path())
            .with_max_soft_failures(tuning.max_soft_failures)
            .with_rate_limit(
                Duration::from_secs(tuning.retry_after_default_secs),
                tuning.max_rate_limit_retries,
            )
            .with_max_retry_after(tuning.max_retry_after());

        let ledger = DownloadLedger::load(&config.paths.ledger_path());
        let state = ScanState::load(&config.paths.scan_state_path());
        status.set_downloaded(ledger.len());
        info!(
            channels = config.settings.channels.len(),
            known_attachments = ledger.len(),
            proxies = pool.proxies().len(),
            download_dir = %config.download_dir.display(),
            "scraper ready"
        );

        Ok(Self {
            config,
            transport,
            status,
            control: Arc::new(Control::new()),
            pool,
            ledger,
            state,
        })
    }

    pub fn control(&self) -> Arc<Control> {
        self.control.clone()
    }

    pub fn ledger(&self) -> &DownloadLedger {
        &self.ledger
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn spawn(self) -> Result<ScraperHandle> {
        let control = self.control.clone();
        let thread = thread::Builder::new()
            .name("clipcrawler-scraper".to_string())
            .spawn(move || self.run())?;
        Ok(ScraperHandle { control, thread })
    }

    /// Polls until stop is requested.
    pub fn run(mut self) {
        self.rebuild_gallery();
        self.status.info("Scraper Started.");

        while !self.control.is_stopped() {
            if self.control.is_paused() {
                self.control
                    .wait(Duration::from_secs(self.config.tuning().pause_poll_secs));
                continue;
            }

            self.cycle();
            if self.control.is_stopped() {
                break;
            }

            let tuning = self.config.tuning();
            let sleep = uniform_secs(
                tuning.cycle_sleep_secs.saturating_sub(tuning.cycle_jitter_secs),
                tuning.cycle_sleep_secs + tuning.cycle_jitter_secs,
            );
            self.status.info(format!(
                "Cycle complete. Waiting for ~{} minutes...",
                sleep.as_secs() / 60
            ));
            self.control.wait(sleep);
        }

        self.status.info("Scraper Stopped.");
    }

    /// One pass over every channel; returns how many files were saved.
    pub fn run_once(&mut self) -> usize {
        self.rebuild_gallery();
        self.cycle()
    }

    fn cycle(&mut self) -> usize {
        let mut channels: Vec<(String, ScanMode)> = self
            .config
            .settings
            .channels
            .iter()
            .map(|c| (c.id.clone(), c.mode))
            .collect();
        channels.shuffle(&mut rand::rng());

        let mut saved = 0;
        for (channel_id, mode) in channels {
            if self.control.is_stopped() {
                break;
            }
            match self.process_channel(&channel_id, mode) {
                Ok(count) => saved += count,
                Err(e) => error!(channel = %channel_id, error = %e, "channel scan failed"),
            }

            let tuning = self.config.tuning();
            let delay = uniform_secs(tuning.channel_delay_min_secs, tuning.channel_delay_max_secs);
            if self.control.wait(delay) {
                break;
            }
        }
        saved
    }

    pub fn process_channel(&mut self, channel_id: &str, mode: ScanMode) -> Result<usize> {
        let mut saved = 0;

        self.status
            .info(format!("Checking for new messages in {channel_id}..."));
        let cursor = match self.state.cursor(channel_id).after {
            Some(id) => Cursor::After(id),
            None => Cursor::Latest,
        };
        match self.fetch_page(channel_id, &cursor) {
            Ok(mut messages) if !messages.is_empty() => {
                messages.reverse();
                saved += self.process_messages(&messages, channel_id);
                if self.control.is_stopped() {
                    return Ok(saved);
                }
                if let Some(newest) = messages.last() {
                    self.state.cursor_mut(channel_id).after = Some(newest.id.clone());
                    self.state.save()?;
                }
            }
            Ok(_) => debug!(channel = %channel_id, "no new messages"),
            Err(EngineError::Fetch(FetchError::Stopped)) => return Ok(saved),
            Err(e) => warn!(channel = %channel_id, error = %e, "new message check failed"),
        }

        if self.control.is_stopped()
            || mode != ScanMode::FullScan
            || self.state.cursor(channel_id).history_complete
        {
            return Ok(saved);
        }

        let tuning = self.config.tuning();
        let polite = uniform_secs(tuning.polite_delay_min_secs, tuning.polite_delay_max_secs);
        if self.control.wait(polite) {
            return Ok(saved);
        }

        self.status
            .info(format!("Backfilling history for {channel_id}..."));
        let cursor = match self.state.cursor(channel_id).before {
            Some(id) => Cursor::Before(id),
            None => Cursor::Latest,
        };
        match self.fetch_page(channel_id, &cursor) {
            Ok(messages) if !messages.is_empty() => {
                saved += self.process_messages(&messages, channel_id);
                if self.control.is_stopped() {
                    return Ok(saved);
                }
                if let Some(oldest) = messages.last() {
                    self.state.cursor_mut(channel_id).before = Some(oldest.id.clone());
                    self.state.save()?;
                }
            }
            Ok(_) => {
                info!(channel = %channel_id, "reached the beginning of channel history");
                self.status
                    .info(format!("History scan for {channel_id} is complete!"));
                self.state.cursor_mut(channel_id).history_complete = true;
                self.state.save()?;
            }
            Err(EngineError::Fetch(FetchError::Stopped)) => {}
            Err(e) => warn!(channel = %channel_id, error = %e, "history backfill failed"),
        }

        Ok(saved)
    }

    fn fetch_page(&mut self, channel_id: &str, cursor: &Cursor) -> Result<Vec<Message>> {
        let tuning = self.config.tuning();
        let url = discord::messages_url(&tuning.api_base, channel_id, cursor, tuning.messages_limit())?;
        let timeout = tuning.request_timeout();
        discord::fetch_messages(
            &mut self.pool,
            self.transport.as_ref(),
            &self.control,
            &self.status,
            &self.config.token,
            &url,
            timeout,
        )
    }

    /// Downloads every unseen video attachment in `messages`, in order.
    pub fn process_messages(&mut self, messages: &[Message], channel_id: &str) -> usize {
        let mut saved = 0;
        for message in messages {
            if self.control.is_stopped() {
                break;
            }
            for attachment in message.attachments.iter().filter(|a| a.is_video()) {
                if self.ledger.contains(&discord::attachment_key(message, attachment)) {
                    continue;
                }
                match self.download_attachment(attachment, message, channel_id) {
                    Ok(DownloadOutcome::Saved) => saved += 1,
                    Ok(DownloadOutcome::AlreadyHave) => {}
                    Ok(DownloadOutcome::Cancelled) => return saved,
                    Err(e) => error!(
                        attachment = %attachment.filename,
                        message = %message.id,
                        error = %e,
                        "download failed; attachment left unrecorded"
                    ),
                }
            }
        }
        saved
    }

    pub fn download_attachment(
        &mut self,
        attachment: &Attachment,
        message: &Message,
        channel_id: &str,
    ) -> Result<DownloadOutcome> {
        let key = discord::attachment_key(message, attachment);
        if self.ledger.contains(&key) {
            return Ok(DownloadOutcome::AlreadyHave);
        }

        let filename = naming::generate_filename(&attachment.filename, &message.content);
        let download_dir = self.config.download_dir.clone();
        let dest = download_dir.join(&filename);
        let part = part_path(&dest);

        let streamed = self.stream_to_file(&attachment.url, &part);
        let (size_bytes, sha256) = match streamed {
            Ok(Some(done)) => done,
            Ok(None) => {
                info!(file = %filename, "download cancelled by stop request");
                remove_quietly(&part);
                return Ok(DownloadOutcome::Cancelled);
            }
            Err(e) => {
                remove_quietly(&part);
                return Err(e);
            }
        };
        if let Err(e) = std::fs::rename(&part, &dest) {
            remove_quietly(&part);
            return Err(e.into());
        }

        let (category, stored) = match media::categorize(&self.config.paths, &download_dir, &dest) {
            Ok(Some((category, moved))) => {
                self.status.info(format!("Categorized: {filename}"));
                (Some(category.folder().to_string()), moved)
            }
            Ok(None) => (None, dest),
            Err(e) => {
                warn!(file = %filename, error = %e, "could not categorize video");
                (None, dest)
            }
        };

        // Without a record and ledger entry the file would be fetched again
        // under a new name, so it is dropped.
        let saved = library::build_record(attachment, message, &filename, channel_id).and_then(
            |mut record| {
                record.category = category;
                record.sha256 = Some(sha256);
                record.size_bytes = i64::try_from(size_bytes).ok();
                library::save_record(&download_dir, &record)
            },
        );
        if let Err(e) = saved {
            remove_quietly(&stored);
            return Err(e);
        }

        self.ledger.insert(key);
        self.ledger.save()?;
        self.status.set_downloaded(self.ledger.len());

        self.rebuild_gallery();
        self.status.info(format!("Downloaded: {filename}"));
        Ok(DownloadOutcome::Saved)
    }

    /// Streams `url` into `part`. `None` means a stop arrived mid-transfer.
    fn stream_to_file(&mut self, url: &str, part: &Path) -> Result<Option<(u64, String)>> {
        let tuning = self.config.tuning();
        let request =
            HttpRequest::get(url, tuning.request_timeout()).streaming(tuning.download_timeout());
        let fetched = self
            .pool
            .fetch(self.transport.as_ref(), &request, &self.control, &self.status);
        let mut response = match fetched {
            Ok(response) => response,
            Err(FetchError::Stopped) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut file = std::fs::File::create(part)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0_u8; DOWNLOAD_CHUNK_BYTES];
        let mut total = 0_u64;
        loop {
            if self.control.is_stopped() {
                return Ok(None);
            }
            let n = match response.body.read(&mut buf) {
                Ok(n) => n,
                Err(e) if http::is_body_timeout(&e) => {
                    self.pool.report_stalled_transfer(&e.to_string(), &self.status);
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        file.flush()?;

        if total == 0 {
            return Err(EngineError::InvalidInput(format!("empty response body from {url}")));
        }
        Ok(Some((total, hex::encode(hasher.finalize()))))
    }

    fn rebuild_gallery(&self) {
        if let Err(e) = gallery::rebuild(
            &self.config.download_dir,
            self.config.tuning().videos_per_page(),
        ) {
            error!(error = %e, "gallery rebuild failed");
        }
    }
}

/// Controls a scraper running on its own thread.
#[derive(Debug)]
pub struct ScraperHandle {
    control: Arc<Control>,
    thread: JoinHandle<()>,
}

impl ScraperHandle {
    pub fn control(&self) -> Arc<Control> {
        self.control.clone()
    }

    pub fn pause(&self) {
        self.control.set_paused(true);
    }

    pub fn resume(&self) {
        self.control.set_paused(false);
    }

    /// Flips the pause flag and returns the new state.
    pub fn toggle_pause(&self) -> bool {
        let paused = !self.control.is_paused();
        self.control.set_paused(paused);
        paused
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn stop(&self) {
        self.control.request_stop();
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("scraper thread panicked");
        }
    }
}

fn uniform_secs(min: u64, max: u64) -> Duration {
    if max <= min {
        return Duration::from_secs(min);
    }
    Duration::from_secs_f64(rand::rng().random_range(min as f64..=max as f64))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove download");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::http::{HttpResponse, TransportError};
    use crate::status::StatusUpdate;
    use std::collections::HashMap;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::Mutex;

    const TOKEN: &str = "test-token";
    const CDN: &str = "https://cdn.test/";

    #[derive(Debug, Clone, Copy)]
    enum StopAt {
        /// Stop while the request is being answered with a 429.
        Request,
        /// Stop after the first body chunk was handed out.
        FirstChunk,
    }

    /// In-memory channel history served newest first, like the real API.
    #[derive(Default)]
    struct FakeDiscord {
        messages: Mutex<HashMap<String, Vec<serde_json::Value>>>,
        files: Mutex<HashMap<String, Vec<u8>>>,
        requests: Mutex<Vec<(String, Option<String>)>>,
        stop_on: Mutex<Option<(String, StopAt, Arc<Control>)>>,
    }

    /// Hands out its bytes, then requests a stop.
    struct StoppingReader {
        inner: std::io::Cursor<Vec<u8>>,
        control: Arc<Control>,
    }

    impl Read for StoppingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.control.request_stop();
            Ok(n)
        }
    }

    impl FakeDiscord {
        fn add_message(&self, channel: &str, id: u64, content: &str, attachments: &[(&str, &str)]) {
            let atts: Vec<serde_json::Value> = attachments
                .iter()
                .enumerate()
                .map(|(i, (name, ct))| {
                    serde_json::json!({
                        "id": format!("{id}{i}"),
                        "filename": name,
                        "url": format!("{CDN}{name}"),
                        "content_type": ct,
                    })
                })
                .collect();
            let msg = serde_json::json!({
                "id": id.to_string(),
                "channel_id": channel,
                "guild_id": "500",
                "author": { "id": "9", "username": "maker" },
                "content": content,
                "timestamp": format!("2025-01-01T00:00:{:02}+00:00", id % 60),
                "attachments": atts,
            });
            let mut all = self.messages.lock().unwrap();
            let list = all.entry(channel.to_string()).or_default();
            list.push(msg);
            list.sort_by_key(|m| std::cmp::Reverse(id_of(m)));
        }

        fn add_file(&self, name: &str, bytes: &[u8]) {
            self.files
                .lock()
                .unwrap()
                .insert(format!("{CDN}{name}"), bytes.to_vec());
        }

        fn stop_on(&self, name: &str, at: StopAt, control: Arc<Control>) {
            *self.stop_on.lock().unwrap() = Some((format!("{CDN}{name}"), at, control));
        }

        fn requested_urls(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|(u, _)| u.clone())
                .collect()
        }
    }

    fn id_of(msg: &serde_json::Value) -> u64 {
        msg["id"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    impl Transport for FakeDiscord {
        fn get(
            &self,
            request: &HttpRequest,
            _proxy: Option<&str>,
        ) -> std::result::Result<HttpResponse, TransportError> {
            let auth = request
                .headers
                .iter()
                .find(|(k, _)| k == "Authorization")
                .map(|(_, v)| v.clone());
            self.requests
                .lock()
                .unwrap()
                .push((request.url.clone(), auth));

            let stop = self
                .stop_on
                .lock()
                .unwrap()
                .as_ref()
                .filter(|(url, _, _)| *url == request.url)
                .map(|(_, at, control)| (*at, control.clone()));
            let body = if let Some(bytes) = self.files.lock().unwrap().get(&request.url) {
                match stop {
                    Some((StopAt::Request, control)) => {
                        control.request_stop();
                        return Ok(HttpResponse {
                            status: 429,
                            retry_after: Some(Duration::from_secs(60)),
                            body: Box::new(std::io::empty()),
                        });
                    }
                    Some((StopAt::FirstChunk, control)) => {
                        return Ok(HttpResponse {
                            status: 200,
                            retry_after: None,
                            body: Box::new(StoppingReader {
                                inner: std::io::Cursor::new(bytes.clone()),
                                control,
                            }),
                        });
                    }
                    None => bytes.clone(),
                }
            } else {
                let url = url::Url::parse(&request.url).expect("url");
                let channel = url
                    .path_segments()
                    .and_then(|mut s| s.nth(2))
                    .unwrap_or_default()
                    .to_string();
                let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
                let limit: usize = query.get("limit").and_then(|l| l.parse().ok()).unwrap_or(100);
                let all = self.messages.lock().unwrap();
                let list = all.get(&channel).cloned().unwrap_or_default();
                let page: Vec<serde_json::Value> = if let Some(after) = query.get("after") {
                    let after: u64 = after.parse().unwrap_or(0);
                    let mut newer: Vec<_> = list.into_iter().filter(|m| id_of(m) > after).collect();
                    // The oldest `limit` messages after the cursor, still newest first.
                    let skip = newer.len().saturating_sub(limit);
                    newer.drain(..skip);
                    newer
                } else if let Some(before) = query.get("before") {
                    let before: u64 = before.parse().unwrap_or(0);
                    list.into_iter()
                        .filter(|m| id_of(m) < before)
                        .take(limit)
                        .collect()
                } else {
                    list.into_iter().take(limit).collect()
                };
                serde_json::to_vec(&page).expect("json")
            };

            Ok(HttpResponse {
                status: 200,
                retry_after: None,
                body: Box::new(std::io::Cursor::new(body)),
            })
        }
    }

    fn quick_tuning() -> Tuning {
        Tuning {
            api_base: "https://api.test/v9".to_string(),
            messages_limit: 2,
            retry_after_default_secs: 0,
            cycle_sleep_secs: 300,
            cycle_jitter_secs: 0,
            channel_delay_min_secs: 0,
            channel_delay_max_secs: 0,
            polite_delay_min_secs: 0,
            polite_delay_max_secs: 0,
            pause_poll_secs: 0,
            ..Tuning::default()
        }
    }

    fn scraper_config(base: &Path, channels: &[(&str, ScanMode)]) -> ScraperConfig {
        let paths = AppPaths::new(base.join("app"));
        let settings = Settings {
            download_dir: None,
            channels: channels
                .iter()
                .map(|(id, mode)| ChannelConfig {
                    id: id.to_string(),
                    name: id.to_string(),
                    mode: *mode,
                })
                .collect(),
            use_proxies: false,
            tuning: quick_tuning(),
        };
        ScraperConfig {
            paths,
            settings,
            token: TOKEN.to_string(),
            download_dir: base.join("downloads"),
        }
    }

    fn scraper_with(
        config: ScraperConfig,
        fake: Arc<FakeDiscord>,
    ) -> (Scraper, Receiver<StatusUpdate>) {
        let (tx, rx) = mpsc::channel();
        let status = StatusSink::new(Some(&config.paths)).with_listener(tx);
        let scraper = Scraper::new(config, fake, status).expect("scraper");
        (scraper, rx)
    }

    fn statuses(rx: &Receiver<StatusUpdate>) -> Vec<String> {
        rx.try_iter().map(|u| u.status).collect()
    }

    fn find_download(download_dir: &Path, name: &str) -> Option<PathBuf> {
        ["", "With_Audio", "Without_Audio", "Invalid_or_Corrupt"]
            .iter()
            .map(|folder| download_dir.join(folder).join(name))
            .find(|p| p.is_file())
    }

    #[test]
    fn full_scan_walks_history_until_complete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = Arc::new(FakeDiscord::default());
        fake.add_message("77", 101, "first clip", &[("a.mp4", "video/mp4")]);
        fake.add_message("77", 102, "", &[("notes.png", "image/png")]);
        fake.add_message("77", 103, "third clip", &[("c.webm", "video/webm")]);
        fake.add_file("a.mp4", b"aaaa");
        fake.add_file("c.webm", b"cccc");

        let config = scraper_config(dir.path(), &[("77", ScanMode::FullScan)]);
        let download_dir = config.download_dir.clone();
        let (mut scraper, rx) = scraper_with(config, fake.clone());

        // Latest page holds 103 and 102; backfill from the newest page then reaches 101.
        assert_eq!(scraper.run_once(), 1);
        let cursor = scraper.state().cursor("77");
        assert_eq!(cursor.after.as_deref(), Some("103"));
        assert_eq!(cursor.before.as_deref(), Some("102"));
        assert!(!cursor.history_complete);

        assert_eq!(scraper.run_once(), 1);
        assert_eq!(scraper.state().cursor("77").before.as_deref(), Some("101"));

        assert_eq!(scraper.run_once(), 0);
        assert!(scraper.state().cursor("77").history_complete);
        assert_eq!(scraper.ledger().len(), 2);
        assert!(scraper.ledger().contains("103-1030"));
        assert!(scraper.ledger().contains("101-1010"));

        let records = library::list_records(&download_dir).expect("records");
        assert_eq!(records.len(), 2);
        for record in &records {
            let file = find_download(&download_dir, &record.download_filename).expect("file on disk");
            let bytes = std::fs::read(&file).expect("read");
            assert_eq!(record.size_bytes, Some(bytes.len() as i64));
            assert_eq!(
                record.sha256.as_deref(),
                Some(hex::encode(Sha256::digest(&bytes)).as_str())
            );
            assert!(record.discord_message_url.starts_with("https://discord.com/channels/500/77/"));
        }
        assert!(records.iter().any(|r| r.download_filename.starts_with("third_clip_")));
        assert!(download_dir.join(gallery::INDEX_FILE).exists());

        let seen = statuses(&rx);
        assert!(seen.contains(&"Checking for new messages in 77...".to_string()));
        assert!(seen.contains(&"Backfilling history for 77...".to_string()));
        assert!(seen.contains(&"History scan for 77 is complete!".to_string()));
        assert_eq!(seen.iter().filter(|s| s.starts_with("Downloaded: ")).count(), 2);

        // API calls carry the token; CDN downloads do not.
        for (url, auth) in fake.requests.lock().unwrap().iter() {
            if url.starts_with(CDN) {
                assert_eq!(auth, &None);
            } else {
                assert_eq!(auth.as_deref(), Some(TOKEN));
            }
        }
    }

    #[test]
    fn state_survives_restart_and_skips_known_attachments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = Arc::new(FakeDiscord::default());
        fake.add_message("88", 5, "clip", &[("x.mp4", "video/mp4")]);
        fake.add_file("x.mp4", b"xxxx");

        let config = scraper_config(dir.path(), &[("88", ScanMode::NewOnly)]);
        let (mut first, _rx) = scraper_with(config.clone(), fake.clone());
        assert_eq!(first.run_once(), 1);
        drop(first);

        fake.add_message("88", 6, "next", &[("y.mp4", "video/mp4")]);
        fake.add_file("y.mp4", b"yyyy");
        let (mut second, _rx) = scraper_with(config, fake.clone());
        assert_eq!(second.ledger().len(), 1);
        assert_eq!(second.run_once(), 1);
        assert_eq!(second.state().cursor("88").after.as_deref(), Some("6"));

        let urls = fake.requested_urls();
        assert!(urls.iter().any(|u| u.ends_with("after=5")));
        assert!(!urls.iter().any(|u| u.contains("before=")));
        assert_eq!(urls.iter().filter(|u| u.as_str() == "https://cdn.test/x.mp4").count(), 1);
    }

    #[test]
    fn empty_download_is_not_recorded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = Arc::new(FakeDiscord::default());
        fake.add_message("77", 1, "empty", &[("e.mp4", "video/mp4")]);
        fake.add_file("e.mp4", b"");

        let config = scraper_config(dir.path(), &[("77", ScanMode::NewOnly)]);
        let download_dir = config.download_dir.clone();
        let (mut scraper, _rx) = scraper_with(config, fake);
        assert_eq!(scraper.run_once(), 0);
        assert!(scraper.ledger().is_empty());
        assert_eq!(library::count_records(&download_dir).expect("count"), 0);

        let leftovers: Vec<_> = std::fs::read_dir(&download_dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file() && !e.file_name().to_string_lossy().starts_with('_'))
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    }

    fn files_under(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir).expect("read dir").filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                found.extend(files_under(&path));
            } else {
                found.push(path);
            }
        }
        found
    }

    #[test]
    fn stop_mid_transfer_discards_part_and_keeps_cursors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = Arc::new(FakeDiscord::default());
        fake.add_message("77", 101, "oldest", &[("a.mp4", "video/mp4")]);
        fake.add_message("77", 102, "middle", &[("b.mp4", "video/mp4")]);
        fake.add_message("77", 103, "newest", &[("c.mp4", "video/mp4")]);
        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            fake.add_file(name, b"bytes");
        }

        let config = scraper_config(dir.path(), &[("77", ScanMode::FullScan)]);
        let download_dir = config.download_dir.clone();

        // Incremental pass: the first download of the page is interrupted.
        let (mut scraper, rx) = scraper_with(config.clone(), fake.clone());
        fake.stop_on("b.mp4", StopAt::FirstChunk, scraper.control());
        assert_eq!(scraper.run_once(), 0);
        assert!(scraper.control().is_stopped());
        assert_eq!(scraper.state().cursor("77").after, None);
        assert_eq!(scraper.state().cursor("77").before, None);
        assert!(scraper.ledger().is_empty());
        assert_eq!(library::count_records(&download_dir).expect("count"), 0);
        assert!(files_under(&download_dir)
            .iter()
            .all(|p| !p.to_string_lossy().ends_with(".part")));
        assert!(!statuses(&rx).iter().any(|s| s.starts_with("Downloaded: ")));
        // The stop came before the newer attachment on the page.
        assert!(!fake.requested_urls().contains(&format!("{CDN}c.mp4")));
        drop(scraper);

        // A fresh worker completes the page, then a stop lands during backfill.
        *fake.stop_on.lock().unwrap() = None;
        let (mut scraper, _rx) = scraper_with(config.clone(), fake.clone());
        assert_eq!(scraper.run_once(), 2);
        assert_eq!(scraper.state().cursor("77").after.as_deref(), Some("103"));
        assert_eq!(scraper.state().cursor("77").before.as_deref(), Some("102"));
        drop(scraper);

        let (mut scraper, _rx) = scraper_with(config, fake.clone());
        fake.stop_on("a.mp4", StopAt::FirstChunk, scraper.control());
        assert_eq!(scraper.run_once(), 0);
        assert_eq!(scraper.state().cursor("77").before.as_deref(), Some("102"));
        assert!(!scraper.state().cursor("77").history_complete);
        assert!(!scraper.ledger().contains("101-1010"));
        assert!(files_under(&download_dir)
            .iter()
            .all(|p| !p.to_string_lossy().ends_with(".part")));

        let reloaded = ScanState::load(&scraper_config(dir.path(), &[]).paths.scan_state_path());
        assert_eq!(reloaded.cursor("77").before.as_deref(), Some("102"));
    }

    #[test]
    fn stop_during_rate_limit_wait_cancels_the_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = Arc::new(FakeDiscord::default());
        fake.add_message("77", 7, "pair", &[("a.mp4", "video/mp4"), ("b.mp4", "video/mp4")]);
        fake.add_file("a.mp4", b"aaaa");
        fake.add_file("b.mp4", b"bbbb");

        let config = scraper_config(dir.path(), &[("77", ScanMode::NewOnly)]);
        let (mut scraper, _rx) = scraper_with(config, fake.clone());
        fake.stop_on("a.mp4", StopAt::Request, scraper.control());

        let messages = scraper.fetch_page("77", &Cursor::Latest).expect("page");
        assert_eq!(scraper.process_messages(&messages, "77"), 0);
        assert!(scraper.control().is_stopped());
        assert!(fake.requested_urls().contains(&format!("{CDN}a.mp4")));
        assert!(!fake.requested_urls().contains(&format!("{CDN}b.mp4")));
        assert!(scraper.ledger().is_empty());

        let outcome = scraper
            .download_attachment(&messages[0].attachments[0], &messages[0], "77")
            .expect("cancelled, not failed");
        assert_eq!(outcome, DownloadOutcome::Cancelled);
    }

    #[test]
    fn failed_record_save_removes_the_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = Arc::new(FakeDiscord::default());
        fake.add_message("77", 1, "clip", &[("a.mp4", "video/mp4")]);
        fake.add_file("a.mp4", b"aaaa");

        let config = scraper_config(dir.path(), &[("77", ScanMode::NewOnly)]);
        let download_dir = config.download_dir.clone();
        // A directory where the database file belongs makes every open fail.
        std::fs::create_dir_all(AppPaths::db_path(&download_dir)).expect("block db");

        let (mut scraper, _rx) = scraper_with(config, fake);
        let messages = scraper.fetch_page("77", &Cursor::Latest).expect("page");
        scraper
            .download_attachment(&messages[0].attachments[0], &messages[0], "77")
            .expect_err("save should fail");

        assert!(scraper.ledger().is_empty());
        let videos: Vec<_> = files_under(&download_dir)
            .into_iter()
            .filter(|p| !p.starts_with(download_dir.join("sql_database")))
            .filter(|p| !p.file_name().is_some_and(|n| n.to_string_lossy().starts_with('_')))
            .collect();
        assert!(videos.is_empty(), "unexpected files: {videos:?}");
    }

    #[test]
    fn stop_request_ends_the_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = Arc::new(FakeDiscord::default());
        let config = scraper_config(dir.path(), &[("77", ScanMode::NewOnly)]);
        let (scraper, rx) = scraper_with(config, fake);

        let handle = scraper.spawn().expect("spawn");
        assert!(handle.toggle_pause());
        assert!(handle.is_paused());
        handle.resume();
        assert!(!handle.is_paused());

        handle.stop();
        handle.join();

        let seen: Vec<String> = rx.iter().map(|u| u.status).collect();
        assert_eq!(seen.first().map(String::as_str), Some("Scraper Started."));
        assert_eq!(seen.last().map(String::as_str), Some("Scraper Stopped."));
    }

    #[test]
    fn uniform_secs_stays_in_range() {
        assert_eq!(uniform_secs(5, 5), Duration::from_secs(5));
        assert_eq!(uniform_secs(9, 3), Duration::from_secs(9));
        for _ in 0..50 {
            let d = uniform_secs(1, 3);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(3));
        }
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/d/clip.mp4")),
            PathBuf::from("/d/clip.mp4.part")
        );
    }
}
