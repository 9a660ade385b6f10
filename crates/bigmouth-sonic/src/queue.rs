//! Playback queue: ordered hand-off of decoded audio from the receive loop
//! to the playback task.
//!
//! Single producer (receive loop), single consumer (playback). The shared
//! depth counter exists so the supervisor can observe emptiness without
//! touching the channel itself.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// One decoded PCM chunk in arrival order.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Raw 16-bit little-endian mono PCM at the canonical output rate.
    pub pcm: Vec<u8>,
    /// Arrival sequence number, assigned by the producer.
    pub seq: u64,
}

/// Create a connected producer/consumer pair.
pub fn playback_queue() -> (PlaybackProducer, PlaybackConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        PlaybackProducer {
            tx,
            pending: Arc::clone(&pending),
            next_seq: AtomicU64::new(0),
        },
        PlaybackConsumer { rx, pending },
    )
}

/// Producer half, owned by the receive loop.
pub struct PlaybackProducer {
    tx: mpsc::UnboundedSender<AudioChunk>,
    pending: Arc<AtomicUsize>,
    next_seq: AtomicU64,
}

impl PlaybackProducer {
    /// Enqueue a chunk; returns false when the consumer is gone.
    pub fn push(&self, pcm: Vec<u8>) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(AudioChunk { pcm, seq }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Cloneable observer of queue emptiness.
    pub fn depth(&self) -> QueueDepth {
        QueueDepth(Arc::clone(&self.pending))
    }
}

/// Consumer half, owned by the playback task.
pub struct PlaybackConsumer {
    rx: mpsc::UnboundedReceiver<AudioChunk>,
    pending: Arc<AtomicUsize>,
}

impl PlaybackConsumer {
    /// Dequeue the next chunk in arrival order; `None` once the producer is
    /// dropped and the queue is drained.
    pub async fn pop(&mut self) -> Option<AudioChunk> {
        let chunk = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(chunk)
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth(Arc::clone(&self.pending))
    }
}

/// Shared view of how many chunks are awaiting playback.
#[derive(Clone)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    pub fn len(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn dequeue_order_matches_enqueue_order() {
        let (producer, mut consumer) = playback_queue();
        for i in 0u8..32 {
            assert!(producer.push(vec![i]));
        }
        for i in 0u64..32 {
            let chunk = consumer.pop().await.unwrap();
            assert_eq!(chunk.seq, i);
            assert_eq!(chunk.pcm, vec![i as u8]);
        }
    }

    /// FIFO must hold for any interleaving of producer and consumer timing;
    /// jitter both sides with a deterministic generator.
    #[tokio::test(start_paused = true)]
    async fn fifo_under_randomized_timing() {
        let (producer, mut consumer) = playback_queue();
        let total = 64u64;

        let feeder = tokio::spawn(async move {
            // Small LCG so the interleaving is scrambled but reproducible.
            let mut state = 0x2545_f491u64;
            for i in 0..total {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                let jitter = state >> 60; // 0..16 ms
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                producer.push(i.to_le_bytes().to_vec());
            }
        });

        let mut state = 0x9e37_79b9u64;
        for expected in 0..total {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            tokio::time::sleep(Duration::from_millis(state >> 61)).await;
            let chunk = consumer.pop().await.unwrap();
            assert_eq!(chunk.seq, expected);
            assert_eq!(chunk.pcm, expected.to_le_bytes().to_vec());
        }
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn depth_tracks_pending_chunks() {
        let (producer, mut consumer) = playback_queue();
        let depth = producer.depth();
        assert!(depth.is_empty());

        producer.push(vec![0]);
        producer.push(vec![1]);
        assert_eq!(depth.len(), 2);

        consumer.pop().await.unwrap();
        assert_eq!(depth.len(), 1);
        consumer.pop().await.unwrap();
        assert!(depth.is_empty());
    }

    #[tokio::test]
    async fn push_after_consumer_drop_reports_failure() {
        let (producer, consumer) = playback_queue();
        drop(consumer);
        assert!(!producer.push(vec![0]));
        assert!(producer.depth().is_empty());
    }
}
