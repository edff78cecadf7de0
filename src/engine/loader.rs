//! Asynchronous file and image loading.
//!
//! Reads and decodes run on worker threads; results come back over a
//! `crossbeam-channel` queue that the render thread drains in
//! [`Engine::process_pending_loads`]. Completion callbacks therefore always run
//! on the render thread, and never for a request whose [`CancellationToken`]
//! was cancelled.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use base64::{Engine as _, engine::general_purpose};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use image::RgbaImage;

use crate::engine::Engine;
use crate::engine::texture::TextureHandle;

/// Shared abort flag for one load request.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type FileLoadedCallback = Box<dyn FnOnce(&mut Engine, Result<Vec<u8>, String>)>;

enum LoadKind {
    Image,
    Bytes,
}

pub(crate) enum LoadPayload {
    Image(RgbaImage),
    Bytes(Vec<u8>),
}

struct LoadResult {
    id: u64,
    outcome: Result<LoadPayload, String>,
}

pub(crate) enum LoadTarget {
    Texture(TextureHandle),
    File(FileLoadedCallback),
}

struct InFlight {
    token: CancellationToken,
    target: LoadTarget,
}

pub(crate) struct TextureLoader {
    tx: Sender<LoadResult>,
    rx: Receiver<LoadResult>,
    next_id: u64,
    in_flight: HashMap<u64, InFlight>,
}

impl Default for TextureLoader {
    fn default() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx, next_id: 1, in_flight: HashMap::new() }
    }
}

impl TextureLoader {
    fn spawn(&mut self, url: String, kind: LoadKind, target: LoadTarget) -> CancellationToken {
        let id = self.next_id;
        self.next_id += 1;
        let token = CancellationToken::new();
        self.in_flight.insert(id, InFlight { token: token.clone(), target });

        let tx = self.tx.clone();
        let worker_token = token.clone();
        thread::spawn(move || {
            if worker_token.is_cancelled() {
                let _ = tx.send(LoadResult { id, outcome: Err("cancelled".to_string()) });
                return;
            }
            let outcome = match kind {
                LoadKind::Image => load_image(&url).map(LoadPayload::Image),
                LoadKind::Bytes => read_url(&url).map(LoadPayload::Bytes),
            }
            .map_err(|e| format!("{e:#}"));
            let _ = tx.send(LoadResult { id, outcome });
        });
        token
    }

    pub(crate) fn request_texture(&mut self, url: &str, texture: TextureHandle) -> CancellationToken {
        log::debug!("loading texture '{}'", short_url(url));
        self.spawn(url.to_string(), LoadKind::Image, LoadTarget::Texture(texture))
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Cancel every outstanding request; their results are discarded.
    pub(crate) fn cancel_all(&mut self) {
        for (_, req) in self.in_flight.drain() {
            req.token.cancel();
        }
    }

    /// Pair a received result with its target, dropping cancelled requests.
    fn accept(&mut self, result: LoadResult) -> Option<(LoadTarget, Result<LoadPayload, String>)> {
        let req = self.in_flight.remove(&result.id)?;
        if req.token.is_cancelled() {
            log::debug!("load #{} cancelled, result dropped", result.id);
            return None;
        }
        Some((req.target, result.outcome))
    }
}

impl Engine {
    /// Read a file or data URL in the background. `callback` runs on the render
    /// thread from [`Engine::process_pending_loads`] unless cancelled first.
    pub fn load_file(
        &mut self,
        url: &str,
        callback: impl FnOnce(&mut Engine, Result<Vec<u8>, String>) + 'static,
    ) -> CancellationToken {
        self.loader
            .spawn(url.to_string(), LoadKind::Bytes, LoadTarget::File(Box::new(callback)))
    }

    pub fn pending_load_count(&self) -> usize {
        self.loader.pending_count()
    }

    /// Deliver every finished load. Returns how many completions ran.
    pub fn process_pending_loads(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(result) = self.loader.rx.try_recv() {
            if self.deliver(result) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Block until every outstanding load has been delivered or `timeout`
    /// elapses. Returns how many completions ran.
    pub fn wait_for_pending_loads(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut delivered = 0;
        while self.loader.pending_count() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.loader.rx.recv_timeout(remaining) {
                Ok(result) => {
                    if self.deliver(result) {
                        delivered += 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!("{} load(s) still pending after {timeout:?}", self.loader.pending_count());
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        delivered
    }

    fn deliver(&mut self, result: LoadResult) -> bool {
        let Some((target, outcome)) = self.loader.accept(result) else {
            return false;
        };
        match (target, outcome) {
            (LoadTarget::Texture(texture), Ok(LoadPayload::Image(img))) => self.complete_texture_load(texture, Ok(img)),
            (LoadTarget::Texture(texture), Ok(LoadPayload::Bytes(_))) => {
                self.complete_texture_load(texture, Err("unexpected raw payload".to_string()))
            }
            (LoadTarget::Texture(texture), Err(e)) => self.complete_texture_load(texture, Err(e)),
            (LoadTarget::File(cb), Ok(LoadPayload::Bytes(bytes))) => cb(self, Ok(bytes)),
            (LoadTarget::File(cb), Ok(LoadPayload::Image(img))) => cb(self, Ok(img.into_raw())),
            (LoadTarget::File(cb), Err(e)) => cb(self, Err(e)),
        }
        true
    }
}

// ── Sources ──────────────────────────────────────────────────────────────

fn short_url(url: &str) -> &str {
    if url.starts_with("data:") {
        url.get(..32).unwrap_or(url)
    } else {
        url
    }
}

fn percent_decode_to_bytes(s: &str) -> Result<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .ok_or_else(|| anyhow!("invalid percent-encoding: truncated"))?;
            out.push(u8::from_str_radix(hex, 16).map_err(|_| anyhow!("invalid percent-encoding '%{hex}'"))?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Decode a `data:` URL to raw bytes.
pub fn decode_data_url(data_url: &str) -> Result<Vec<u8>> {
    let s = data_url.trim();
    let Some(rest) = s.strip_prefix("data:") else {
        bail!("not a data URL");
    };
    let (meta, data) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("invalid data URL: missing comma"))?;
    let is_base64 = meta.split(';').any(|t| t.trim().eq_ignore_ascii_case("base64"));
    if is_base64 {
        general_purpose::STANDARD
            .decode(data.trim())
            .or_else(|_| general_purpose::URL_SAFE.decode(data.trim()))
            .map_err(|e| anyhow!("invalid base64 in data URL: {e}"))
    } else {
        percent_decode_to_bytes(data)
    }
}

/// Bytes behind a data URL, `file://` URL or plain path.
pub fn read_url(url: &str) -> Result<Vec<u8>> {
    if url.starts_with("data:") {
        return decode_data_url(url);
    }
    let path = url.strip_prefix("file://").unwrap_or(url);
    std::fs::read(Path::new(path)).with_context(|| format!("failed to read '{path}'"))
}

/// Load and decode an image to RGBA8.
pub fn load_image(url: &str) -> Result<RgbaImage> {
    let bytes = read_url(url)?;
    let img = image::load_from_memory(&bytes)
        .with_context(|| format!("failed to decode image '{}'", short_url(url)))?;
    Ok(img.to_rgba8())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_base64_and_percent() {
        assert_eq!(decode_data_url("data:text/plain;base64,aGk=").unwrap(), b"hi");
        assert_eq!(decode_data_url("data:,a%20b").unwrap(), b"a b");
        assert!(decode_data_url("http://x").is_err());
        assert!(decode_data_url("data:,%2").is_err());
    }

    #[test]
    fn token_is_shared() {
        let t = CancellationToken::new();
        let c = t.clone();
        c.cancel();
        assert!(t.is_cancelled());
    }
}
