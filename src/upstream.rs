//! Upstream byte sources
//!
//! The demuxer consumes a pipe-like byte stream; where the bytes come from
//! is the fetcher's business. HTTP(S) upstreams use a streaming GET; tests
//! and transcoder plumbing use an in-process pipe.

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::demux::TsDemuxer;
use crate::error::{RelayError, Result};

/// How long the demuxer may go without PAT/PMT before the session fails.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A byte stream feeding one session.
pub enum UpstreamSource {
    Http(HttpSource),
    Pipe(PipeSource),
}

impl UpstreamSource {
    /// Connect to an HTTP(S) upstream with a streaming GET.
    pub async fn connect(url: &str) -> Result<Self> {
        let response = reqwest::get(url)
            .await
            .map_err(|e| RelayError::UpstreamFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| RelayError::UpstreamFailed(e.to_string()))?;
        Ok(UpstreamSource::Http(HttpSource { response }))
    }

    /// In-process pipe; the sender side feeds bytes, dropping it signals EOF.
    pub fn pipe(depth: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(depth);
        (tx, UpstreamSource::Pipe(PipeSource { rx }))
    }

    /// Next chunk of bytes; `None` is a clean EOF.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self {
            UpstreamSource::Http(source) => source
                .response
                .chunk()
                .await
                .map_err(|e| RelayError::UpstreamFailed(e.to_string())),
            UpstreamSource::Pipe(source) => Ok(source.rx.recv().await),
        }
    }
}

pub struct HttpSource {
    response: reqwest::Response,
}

pub struct PipeSource {
    rx: mpsc::Receiver<Bytes>,
}

/// Drive an upstream into a demuxer until EOF, cancellation or failure.
/// A source that never yields PAT/PMT within [`INIT_TIMEOUT`] fails with
/// `UpstreamUnparseable`.
pub fn spawn_pump(
    mut source: UpstreamSource,
    mut demuxer: TsDemuxer,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let init_deadline = tokio::time::Instant::now() + INIT_TIMEOUT;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Stopping),
                chunk = source.next_chunk() => chunk?,
                _ = tokio::time::sleep_until(init_deadline), if !demuxer.is_initialized() => {
                    return Err(RelayError::UpstreamUnparseable(
                        "no PAT/PMT within the init window".into(),
                    ));
                }
            };
            match chunk {
                Some(bytes) => demuxer.write(&bytes)?,
                None => {
                    demuxer.finish();
                    tracing::info!("upstream completed");
                    return Ok(());
                }
            }
        }
    })
}
