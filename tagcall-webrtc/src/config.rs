use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub(crate) const PEER_EVENTS_CAPACITY: usize = 64;
pub(crate) const TRACK_ID: &str = "audio";
pub(crate) const TRACK_STREAM_ID: &str = "tagcall-audio";
pub(crate) const AUDIO_CHANNELS: u16 = 1;
// Opus RTP clock rate is always 48 kHz regardless of the capture rate.
pub(crate) const OPUS_CLOCK_RATE: u32 = 48_000;

/// Public STUN servers used to discover reachable network paths.
/// At least two, for redundancy.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|server| server.to_string())
                .collect(),
        }
    }
}

impl IceConfig {
    pub(crate) fn into_rtc(self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .stun_servers
                .into_iter()
                .map(|url| RTCIceServer {
                    urls: vec![url],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}
