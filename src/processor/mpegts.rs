//! Continuous MPEG-TS processor
//!
//! No segmentation: one persistent muxer feeds a broadcast fan-out. New
//! clients receive the captured PAT/PMT blob first and are gated until a
//! keyframe-aligned chunk; a client whose bounded write queue fills is
//! evicted immediately.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::{SharedEsBuffer, VariantKey};
use crate::config::DeliveryConfig;
use crate::error::{RelayError, Result};
use crate::mux::TsMuxer;
use crate::routing::ClientFormat;

use super::{wait_audio_init, ClientRecord, VariantReader, AUDIO_INIT_WAIT, TICK};

/// Re-emit PAT/PMT roughly every 500 ms of ticks on the continuous path.
const PSI_TICK_INTERVAL: u32 = 50;

struct BroadcastClient {
    record: Arc<ClientRecord>,
    tx: mpsc::Sender<Bytes>,
    sent_header: bool,
    wait_for_keyframe: bool,
}

pub struct MpegtsProcessor {
    consumer_id: String,
    buffer: Arc<SharedEsBuffer>,
    variant_key: VariantKey,
    delivery: DeliveryConfig,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    clients: Arc<RwLock<HashMap<String, BroadcastClient>>>,
    /// First muxer output after initialization: the PAT/PMT tables every
    /// late joiner needs before any payload.
    header: Arc<RwLock<Option<Bytes>>>,
    bytes_served: Arc<AtomicU64>,
}

impl MpegtsProcessor {
    pub fn new(
        buffer: Arc<SharedEsBuffer>,
        variant_key: VariantKey,
        delivery: DeliveryConfig,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            consumer_id: format!("mpegts-{}", uuid::Uuid::new_v4().simple()),
            buffer,
            variant_key,
            delivery,
            cancel: parent_cancel.child_token(),
            task: Mutex::new(None),
            stopping: AtomicBool::new(false),
            clients: Arc::new(RwLock::new(HashMap::new())),
            header: Arc::new(RwLock::new(None)),
            bytes_served: Arc::new(AtomicU64::new(0)),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(RelayError::Stopping);
        }
        let variant = self
            .buffer
            .get_or_create_variant(&self.variant_key, &self.cancel)
            .await?;
        self.buffer.register_processor(&self.consumer_id);
        let reader = VariantReader::new(variant, &self.consumer_id);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(reader).await });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        self.buffer.unregister_processor(&self.consumer_id);
        // Dropping the senders ends every client body stream.
        self.clients.write().clear();
    }

    /// Register a client and hand back its chunk stream. The PAT/PMT
    /// header is always enqueued before any payload chunk.
    pub fn register_client(&self, record: ClientRecord) -> Result<(Arc<ClientRecord>, mpsc::Receiver<Bytes>)> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(RelayError::Stopping);
        }
        let record = Arc::new(record);
        let (tx, rx) = mpsc::channel(self.delivery.write_queue_chunks);
        let mut client = BroadcastClient {
            record: record.clone(),
            tx,
            sent_header: false,
            wait_for_keyframe: true,
        };
        if let Some(header) = self.header.read().clone() {
            // Queue is empty at this point, the send cannot fail.
            if client.tx.try_send(header.clone()).is_ok() {
                client.record.add_bytes(header.len() as u64);
                client.sent_header = true;
            }
        }
        tracing::debug!(client = %record.client_id, "mpegts client joined");
        self.clients.write().insert(record.client_id.clone(), client);
        Ok((record, rx))
    }

    pub fn unregister_client(&self, client_id: &str) {
        if self.clients.write().remove(client_id).is_some() {
            tracing::debug!(client = client_id, "mpegts client left");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> ClientFormat {
        ClientFormat::Mpegts
    }

    /// Idle as soon as nobody is connected.
    pub fn is_idle(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn serve_segment(&self) -> Result<()> {
        Err(RelayError::UnsupportedOperation(
            "the continuous MPEG-TS processor has no segments",
        ))
    }

    /// Deliver one muxed chunk to the audience, partitioning it into
    /// clients already past the keyframe gate and clients still waiting.
    fn broadcast_chunk(&self, chunk: &Bytes, starts_with_keyframe: bool) {
        let header = self.header.read().clone();
        let mut evict: Vec<(String, bool)> = Vec::new();
        {
            let mut clients = self.clients.write();
            for (id, client) in clients.iter_mut() {
                if !client.sent_header {
                    let Some(header) = header.as_ref() else {
                        continue;
                    };
                    match client.tx.try_send(header.clone()) {
                        Ok(()) => {
                            client.record.add_bytes(header.len() as u64);
                            client.sent_header = true;
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            evict.push((id.clone(), true));
                            continue;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            evict.push((id.clone(), false));
                            continue;
                        }
                    }
                }
                if client.wait_for_keyframe {
                    if !starts_with_keyframe {
                        continue;
                    }
                    client.wait_for_keyframe = false;
                }
                match client.tx.try_send(chunk.clone()) {
                    Ok(()) => {
                        client.record.add_bytes(chunk.len() as u64);
                        self.bytes_served.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => evict.push((id.clone(), true)),
                    Err(mpsc::error::TrySendError::Closed(_)) => evict.push((id.clone(), false)),
                }
            }
            for (id, slow) in &evict {
                if clients.remove(id).is_some() && *slow {
                    tracing::warn!(client = %id, "slow client evicted, write queue full");
                }
            }
        }
    }

    async fn run(self: Arc<Self>, mut reader: VariantReader) {
        if reader.wait_for_keyframe(&self.cancel).await.is_err() {
            self.clients.write().clear();
            reader.release();
            return;
        }
        let variant = reader.variant().clone();
        let audio_codec = variant.audio().codec();
        let audio_init = if audio_codec.as_deref() == Some("aac") {
            wait_audio_init(&variant, AUDIO_INIT_WAIT, &self.cancel).await
        } else {
            variant.audio().init_data()
        };

        let mut muxer = TsMuxer::new();
        if let Err(e) = muxer.set_streams(
            variant.video().codec().as_deref(),
            audio_codec.as_deref(),
            audio_init.as_ref(),
        ) {
            tracing::error!(error = %e, "stream not muxable into continuous TS");
            self.clients.write().clear();
            reader.release();
            return;
        }

        // Capture the very first muxer output as the late-join header.
        muxer.write_psi();
        *self.header.write() = Some(muxer.take_output());

        let variant_cancel = variant.cancelled();
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut next_chunk_keyframe = false;
        let mut ticks: u32 = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = variant_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    ticks = ticks.wrapping_add(1);
                    if ticks % PSI_TICK_INTERVAL == 0 && muxer.pending_len() == 0 {
                        muxer.write_psi();
                    }
                    let (video, audio) = reader.read_batch();
                    for sample in &video {
                        if sample.is_keyframe && muxer.pending_len() > 0 {
                            // Cut the chunk so the keyframe starts the next
                            // one; pre-keyframe bytes still reach existing
                            // clients.
                            let chunk = muxer.take_output();
                            self.broadcast_chunk(&chunk, next_chunk_keyframe);
                            next_chunk_keyframe = true;
                        } else if sample.is_keyframe {
                            next_chunk_keyframe = true;
                        }
                        let _ = muxer.mux_video(sample.pts, sample.dts, &sample.data, sample.is_keyframe);
                    }
                    for sample in &audio {
                        let _ = muxer.mux_audio(sample.pts, &sample.data);
                    }
                    if muxer.pending_len() > 0 {
                        let chunk = muxer.take_output();
                        self.broadcast_chunk(&chunk, next_chunk_keyframe);
                        next_chunk_keyframe = false;
                    }
                }
            }
        }
        if muxer.pending_len() > 0 {
            let chunk = muxer.take_output();
            self.broadcast_chunk(&chunk, next_chunk_keyframe);
        }
        // Close all client streams so hung connections see EOF.
        self.clients.write().clear();
        reader.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor_with_queue(depth: usize) -> Arc<MpegtsProcessor> {
        let buffer = SharedEsBuffer::new(Default::default(), CancellationToken::new());
        MpegtsProcessor::new(
            buffer,
            VariantKey::Copy,
            DeliveryConfig {
                write_queue_chunks: depth,
            },
            &CancellationToken::new(),
        )
    }

    fn record(id: &str) -> ClientRecord {
        ClientRecord::new(id, "127.0.0.1:9", "test", ClientFormat::Mpegts)
    }

    #[tokio::test]
    async fn test_header_always_precedes_payload() {
        let processor = processor_with_queue(8);
        *processor.header.write() = Some(Bytes::from_static(b"HDR"));
        let (_rec, mut rx) = processor.register_client(record("a")).unwrap();
        processor.broadcast_chunk(&Bytes::from_static(b"KEY1"), true);
        processor.broadcast_chunk(&Bytes::from_static(b"data"), false);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"HDR"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"KEY1"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"data"));
    }

    #[tokio::test]
    async fn test_keyframe_gate_skips_mid_gop_join() {
        let processor = processor_with_queue(8);
        *processor.header.write() = Some(Bytes::from_static(b"HDR"));
        let (_rec, mut rx) = processor.register_client(record("late")).unwrap();
        // Mid-GOP bytes are withheld from the gated client.
        processor.broadcast_chunk(&Bytes::from_static(b"mid1"), false);
        processor.broadcast_chunk(&Bytes::from_static(b"mid2"), false);
        processor.broadcast_chunk(&Bytes::from_static(b"KEY2"), true);
        processor.broadcast_chunk(&Bytes::from_static(b"tail"), false);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"HDR"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"KEY2"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"tail"));
    }

    #[tokio::test]
    async fn test_header_sent_late_when_captured_after_join() {
        let processor = processor_with_queue(8);
        let (_rec, mut rx) = processor.register_client(record("early")).unwrap();
        // No header yet: the client receives nothing at all.
        processor.broadcast_chunk(&Bytes::from_static(b"KEYx"), true);
        *processor.header.write() = Some(Bytes::from_static(b"HDR"));
        processor.broadcast_chunk(&Bytes::from_static(b"KEY1"), true);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"HDR"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"KEY1"));
    }

    #[tokio::test]
    async fn test_slow_client_evicted_others_unaffected() {
        let processor = processor_with_queue(2);
        *processor.header.write() = Some(Bytes::from_static(b"H"));
        let (_slow_rec, _slow_rx) = processor.register_client(record("slow")).unwrap();
        let (_fast_rec, mut fast_rx) = processor.register_client(record("fast")).unwrap();

        // Header plus one chunk fill the two-slot queue.
        processor.broadcast_chunk(&Bytes::from_static(b"K1"), true);
        assert_eq!(processor.client_count(), 2);

        // The fast client drains, the slow one never does.
        assert_eq!(fast_rx.try_recv().unwrap(), Bytes::from_static(b"H"));
        assert_eq!(fast_rx.try_recv().unwrap(), Bytes::from_static(b"K1"));

        processor.broadcast_chunk(&Bytes::from_static(b"c2"), false);
        assert_eq!(processor.client_count(), 1, "slow client evicted");
        assert_eq!(fast_rx.try_recv().unwrap(), Bytes::from_static(b"c2"));
    }

    #[tokio::test]
    async fn test_disconnected_client_removed_silently() {
        let processor = processor_with_queue(4);
        *processor.header.write() = Some(Bytes::from_static(b"H"));
        let (_rec, rx) = processor.register_client(record("gone")).unwrap();
        drop(rx);
        processor.broadcast_chunk(&Bytes::from_static(b"K"), true);
        assert_eq!(processor.client_count(), 0);
        assert!(processor.is_idle());
    }

    #[test]
    fn test_serve_segment_unsupported() {
        let processor = processor_with_queue(4);
        assert!(matches!(
            processor.serve_segment(),
            Err(RelayError::UnsupportedOperation(_))
        ));
    }
}
