//! Stream framing transport: whole application values over one data channel.
//!
//! Outbound values are encoded to a frame, split into chunks and written strictly in order,
//! pausing while the channel's send buffer is above the high-water mark. Inbound chunks feed a
//! streaming decoder; only complete values are emitted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::chunk::{split_into_chunks, Watermarks};
use crate::transport::{ChannelEvent, DataChannel, TransportError};
use crate::wire::{encode_frame, FrameDecodeError, FrameDecoder, FrameEncodeError};

#[derive(Debug, Error, Clone)]
pub enum FramingError {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("send: {0}")]
    Send(#[from] TransportError),
    #[error("transport closed")]
    Closed,
}

impl From<FrameEncodeError> for FramingError {
    fn from(e: FrameEncodeError) -> Self {
        FramingError::Encode(e.to_string())
    }
}

impl From<FrameDecodeError> for FramingError {
    fn from(e: FrameDecodeError) -> Self {
        FramingError::Decode(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Open,
    Data(Value),
    /// A decode or send failure. Decode failures leave the channel open.
    Error(FramingError),
    Close,
}

enum Outbound {
    Frame(Bytes),
    Close,
}

/// Handle to the framing tasks of one data channel. Cheap to clone.
#[derive(Clone)]
pub struct StreamTransport {
    channel: Arc<dyn DataChannel>,
    outbound: mpsc::UnboundedSender<Outbound>,
    opened: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
}

impl StreamTransport {
    pub fn new(
        channel: Arc<dyn DataChannel>,
        chunk_size: usize,
        watermarks: Watermarks,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        match channel.take_events() {
            Some(channel_events) => {
                tokio::spawn(read_loop(channel_events, open_tx, ev_tx.clone(), closed.clone()));
            }
            None => {
                warn!("data channel {} already taken", channel.label());
                closed.store(true, Ordering::SeqCst);
                let _ = ev_tx.send(StreamEvent::Error(FramingError::Closed));
                let _ = ev_tx.send(StreamEvent::Close);
            }
        }
        let writer = Writer {
            channel: channel.clone(),
            chunk_size,
            watermarks,
            events: ev_tx,
        };
        tokio::spawn(writer.run(out_rx, open_rx.clone()));

        let handle = Self {
            channel,
            outbound: out_tx,
            opened: open_rx,
            closed,
        };
        (handle, ev_rx)
    }

    /// Encode and queue one value. Queued values are written once the channel opens.
    pub fn send<T: Serialize>(&self, value: &T) -> Result<(), FramingError> {
        if self.is_closed() {
            return Err(FramingError::Closed);
        }
        let frame = encode_frame(value)?;
        self.outbound
            .send(Outbound::Frame(Bytes::from(frame)))
            .map_err(|_| FramingError::Closed)
    }

    pub fn is_open(&self) -> bool {
        *self.opened.borrow() && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn label(&self) -> String {
        self.channel.label()
    }

    /// Flush queued values, then close the channel. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Nothing can flush before the channel opens.
        if !*self.opened.borrow() || self.outbound.send(Outbound::Close).is_err() {
            let channel = self.channel.clone();
            tokio::spawn(async move { channel.close().await });
        }
    }
}

async fn read_loop(
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    open_tx: watch::Sender<bool>,
    events: mpsc::UnboundedSender<StreamEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new();
    while let Some(ev) = channel_events.recv().await {
        match ev {
            ChannelEvent::Open => {
                let _ = open_tx.send(true);
                let _ = events.send(StreamEvent::Open);
            }
            ChannelEvent::Message(chunk) => {
                decoder.push(&chunk);
                loop {
                    match decoder.next_frame::<Value>() {
                        Ok(Some(value)) => {
                            let _ = events.send(StreamEvent::Data(value));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("dropping undecodable frame: {}", e);
                            let _ = events.send(StreamEvent::Error(e.into()));
                        }
                    }
                }
            }
            ChannelEvent::Closed => break,
        }
    }
    closed.store(true, Ordering::SeqCst);
    if decoder.pending() > 0 {
        debug!("discarding {} bytes of a partial frame", decoder.pending());
    }
    let _ = events.send(StreamEvent::Close);
}

struct Writer {
    channel: Arc<dyn DataChannel>,
    chunk_size: usize,
    watermarks: Watermarks,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl Writer {
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<Outbound>, mut opened: watch::Receiver<bool>) {
        if opened.wait_for(|open| *open).await.is_err() {
            debug!("channel {} closed before opening", self.channel.label());
            return;
        }
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    if let Err(e) = self.write_frame(frame).await {
                        error!("send on {} failed, closing: {}", self.channel.label(), e);
                        let _ = self.events.send(StreamEvent::Error(e.into()));
                        self.channel.close().await;
                        return;
                    }
                }
                Outbound::Close => {
                    self.channel.buffered_amount_low(0).await;
                    self.channel.close().await;
                    return;
                }
            }
        }
    }

    async fn write_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        for chunk in split_into_chunks(frame, self.chunk_size) {
            let buffered = self.channel.buffered_amount().await;
            if self.watermarks.must_wait(buffered, chunk.len()) {
                self.channel.buffered_amount_low(self.watermarks.low).await;
            }
            self.channel.send(chunk).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::protocol::IceConfig;
    use crate::transport::{PeerConnection, PeerConnectionFactory, PeerEvent};
    use serde_json::json;

    async fn channel_pair() -> (
        Arc<dyn DataChannel>,
        Arc<dyn DataChannel>,
        Arc<dyn PeerConnection>,
        Arc<dyn PeerConnection>,
    ) {
        let net = MemoryNetwork::new();
        let cfg = IceConfig::default();
        let (a, _) = net.create(&cfg).await.unwrap();
        let (b, mut b_events) = net.create(&cfg).await.unwrap();
        let dc_a = a.create_data_channel("dc").await.unwrap();
        b.set_remote_description(a.create_offer(false).await.unwrap())
            .await
            .unwrap();
        a.set_remote_description(b.create_answer().await.unwrap())
            .await
            .unwrap();
        let dc_b = loop {
            if let Some(PeerEvent::DataChannel(dc)) = b_events.recv().await {
                break dc;
            }
        };
        (dc_a, dc_b, a, b)
    }

    async fn next_data(events: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Value {
        loop {
            match events.recv().await {
                Some(StreamEvent::Data(v)) => return v,
                Some(StreamEvent::Open) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn open_precedes_data() {
        let (dc_a, dc_b, _a, _b) = channel_pair().await;
        let (a, mut a_events) = StreamTransport::new(dc_a, 1024, Watermarks::default());
        let (_b, mut b_events) = StreamTransport::new(dc_b, 1024, Watermarks::default());
        assert!(matches!(a_events.recv().await, Some(StreamEvent::Open)));
        a.send(&json!({"hello": 1})).unwrap();
        assert!(matches!(b_events.recv().await, Some(StreamEvent::Open)));
        assert_eq!(next_data(&mut b_events).await, json!({"hello": 1}));
    }

    #[tokio::test]
    async fn large_values_survive_chunking_and_backpressure() {
        let (dc_a, dc_b, _a, _b) = channel_pair().await;
        let (a, _a_events) = StreamTransport::new(dc_a, 1000, Watermarks::new(4000));
        let (_b, mut b_events) = StreamTransport::new(dc_b, 1000, Watermarks::new(4000));

        let big: String = (0..50_000u32).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let values: Vec<Value> = (0..3).map(|i| json!({"seq": i, "blob": big})).collect();
        for v in &values {
            a.send(v).unwrap();
        }
        for v in &values {
            assert_eq!(&next_data(&mut b_events).await, v);
        }
    }

    #[tokio::test]
    async fn sends_before_open_are_held() {
        let net = MemoryNetwork::new();
        let cfg = IceConfig::default();
        let (a, _) = net.create(&cfg).await.unwrap();
        let (b, mut b_pc_events) = net.create(&cfg).await.unwrap();
        let dc_a = a.create_data_channel("dc").await.unwrap();
        let (tx, _tx_events) = StreamTransport::new(dc_a, 64, Watermarks::default());
        tx.send(&json!("early")).unwrap();
        assert!(!tx.is_open());

        b.set_remote_description(a.create_offer(false).await.unwrap())
            .await
            .unwrap();
        a.set_remote_description(b.create_answer().await.unwrap())
            .await
            .unwrap();
        let dc_b = loop {
            if let Some(PeerEvent::DataChannel(dc)) = b_pc_events.recv().await {
                break dc;
            }
        };
        let (_rx, mut rx_events) = StreamTransport::new(dc_b, 64, Watermarks::default());
        assert_eq!(next_data(&mut rx_events).await, json!("early"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (dc_a, dc_b, _a, _b) = channel_pair().await;
        let (a, mut a_events) = StreamTransport::new(dc_a, 1024, Watermarks::default());
        let (_b, mut b_events) = StreamTransport::new(dc_b, 1024, Watermarks::default());
        assert!(matches!(a_events.recv().await, Some(StreamEvent::Open)));
        a.send(&json!("last")).unwrap();
        a.close();
        a.close();
        assert!(matches!(a.send(&json!(1)), Err(FramingError::Closed)));

        let mut closes = 0;
        while let Some(ev) = a_events.recv().await {
            if let StreamEvent::Close = ev {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
        assert_eq!(next_data(&mut b_events).await, json!("last"));
        assert!(matches!(b_events.recv().await, Some(StreamEvent::Close)));
    }

    #[tokio::test]
    async fn corrupt_frame_reports_error_and_stays_open() {
        let (dc_a, dc_b, _a, _b) = channel_pair().await;
        let (_b, mut b_events) = StreamTransport::new(dc_b, 1024, Watermarks::default());
        let mut raw_events = dc_a.take_events().unwrap();
        assert!(matches!(raw_events.recv().await, Some(ChannelEvent::Open)));

        let mut bad = 2u32.to_le_bytes().to_vec();
        bad.extend_from_slice(&[0x1c, 0x1c]);
        dc_a.send(Bytes::from(bad)).await.unwrap();
        dc_a.send(Bytes::from(encode_frame(&json!("ok")).unwrap())).await.unwrap();

        assert!(matches!(b_events.recv().await, Some(StreamEvent::Open)));
        assert!(matches!(
            b_events.recv().await,
            Some(StreamEvent::Error(FramingError::Decode(_)))
        ));
        assert_eq!(next_data(&mut b_events).await, json!("ok"));
    }
}
