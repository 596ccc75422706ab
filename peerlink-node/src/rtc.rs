//! Direct transport on the webrtc crate: peer connections, ordered data channels, and
//! placeholder local tracks for media calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use peerlink_core::protocol::{IceCandidate, IceConfig, SdpType, SessionDescription};
use peerlink_core::transport::{
    ChannelEvent, ChannelState, DataChannel, IceConnectionState, MediaTrack, PeerConnection,
    PeerConnectionFactory, PeerEvent, TrackKind, TransportError,
};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn failed(e: impl std::fmt::Display) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

fn negotiation(e: impl std::fmt::Display) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn rtc_config(config: &IceConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn local_track(track: &MediaTrack) -> Arc<dyn TrackLocal + Send + Sync> {
    let mime_type = match track.kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        track.id.clone(),
        track.stream_id.clone(),
    ))
}

/// Data channel wrapper feeding callbacks into an ordered event receiver.
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    low: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl RtcDataChannel {
    async fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let opened = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let low = Arc::new(Notify::new());

        let open_tx = tx.clone();
        let open_flag = opened.clone();
        dc.on_open(Box::new(move || {
            if !open_flag.swap(true, Ordering::SeqCst) {
                let _ = open_tx.send(ChannelEvent::Open);
            }
            Box::pin(async {})
        }));
        let msg_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = msg_tx.send(ChannelEvent::Message(msg.data));
            Box::pin(async {})
        }));
        let close_tx = tx.clone();
        let close_flag = closed.clone();
        let close_low = low.clone();
        dc.on_close(Box::new(move || {
            if !close_flag.swap(true, Ordering::SeqCst) {
                let _ = close_tx.send(ChannelEvent::Closed);
            }
            close_low.notify_waiters();
            Box::pin(async {})
        }));
        let drained = low.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            drained.notify_waiters();
            Box::pin(async {})
        }))
        .await;

        // The remote side's channel may already be open by the time it is handed over.
        if dc.ready_state() == RTCDataChannelState::Open && !opened.swap(true, Ordering::SeqCst) {
            let _ = tx.send(ChannelEvent::Open);
        }
        Arc::new(Self {
            dc,
            events: Mutex::new(Some(rx)),
            low,
            closed,
        })
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn buffered_amount_low(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
        loop {
            let notified = self.low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.closed.load(Ordering::SeqCst) || self.dc.buffered_amount().await <= threshold {
                return;
            }
            notified.await;
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("data channel close: {}", e);
        }
    }
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    senders: tokio::sync::Mutex<Vec<Arc<RTCRtpSender>>>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let dc = self.pc.create_data_channel(label, None).await.map_err(failed)?;
        Ok(RtcDataChannel::wrap(dc).await)
    }

    async fn add_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError> {
        let mut senders = self.senders.lock().await;
        for track in tracks {
            let sender = self.pc.add_track(local_track(track)).await.map_err(failed)?;
            senders.push(sender);
        }
        Ok(())
    }

    async fn replace_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError> {
        let senders = self.senders.lock().await.clone();
        if senders.is_empty() {
            return self.add_tracks(tracks).await;
        }
        for (i, sender) in senders.iter().enumerate() {
            let track = tracks.get(i).map(local_track);
            sender.replace_track(track).await.map_err(failed)?;
        }
        Ok(())
    }

    async fn create_offer(&self, receive_media: bool) -> Result<SessionDescription, TransportError> {
        if receive_media && self.senders.lock().await.is_empty() {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                let init = RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                };
                self.pc
                    .add_transceiver_from_kind(kind, Some(init))
                    .await
                    .map_err(negotiation)?;
            }
        }
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(negotiation)?;
        self.pc.set_remote_description(desc).await.map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(negotiation)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!("peer connection close: {}", e);
        }
    }
}

/// Builds webrtc peer connections with the default codecs and interceptors.
#[derive(Debug, Default, Clone)]
pub struct WebRtcFactory;

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        config: &IceConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(failed)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(api.new_peer_connection(rtc_config(config)).await.map_err(failed)?);
        let (tx, rx) = mpsc::unbounded_channel();

        let cand_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let cand_tx = cand_tx.clone();
            Box::pin(async move {
                let Some(c) = candidate else { return };
                match c.to_json() {
                    Ok(init) => {
                        let _ = cand_tx.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("ice candidate encode: {}", e),
                }
            })
        }));

        let state_tx = tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            if let Some(state) = ice_state(state) {
                let _ = state_tx.send(PeerEvent::IceStateChanged(state));
            }
            Box::pin(async {})
        }));

        let dc_tx = tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let dc_tx = dc_tx.clone();
            Box::pin(async move {
                debug!("remote data channel {}", dc.label());
                let channel: Arc<dyn DataChannel> = RtcDataChannel::wrap(dc).await;
                let _ = dc_tx.send(PeerEvent::DataChannel(channel));
            })
        }));

        let track_tx = tx;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let _ = track_tx.send(PeerEvent::Track(MediaTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            }));
            Box::pin(async {})
        }));

        let connection: Arc<dyn PeerConnection> = Arc::new(RtcPeerConnection {
            pc,
            senders: tokio::sync::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        Ok((connection, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::protocol::IceServer;

    #[test]
    fn ice_servers_carry_credentials() {
        let config = IceConfig {
            ice_servers: vec![IceServer {
                urls: vec!["turn:turn.example.org:3478".into()],
                username: Some("u".into()),
                credential: Some("p".into()),
            }],
        };
        let rtc = rtc_config(&config);
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].username, "u");
        assert_eq!(rtc.ice_servers[0].credential, "p");
    }

    #[test]
    fn ice_states_map() {
        assert_eq!(ice_state(RTCIceConnectionState::Checking), Some(IceConnectionState::Checking));
        assert_eq!(ice_state(RTCIceConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn offer_describes_data_channel() {
        let (pc, _events) = WebRtcFactory.create(&IceConfig::default()).await.unwrap();
        let dc = pc.create_data_channel("dc:peerlink").await.unwrap();
        assert_eq!(dc.label(), "dc:peerlink");
        let offer = pc.create_offer(false).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=application"));
        pc.close().await;
        pc.close().await;
        assert!(pc.is_closed());
    }
}
