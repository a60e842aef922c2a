use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

#[derive(Debug, Clone)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub ice_servers: Vec<RTCIceServer>,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub key: String,
    pub secure: bool,
}

impl SignalingConfig {
    pub fn url(&self, id: &str, token: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.ends_with('/') { self.path.clone() } else { format!("{}/", self.path) };
        format!("{scheme}://{}:{}{path}peerjs?key={}&id={id}&token={token}", self.host, self.port, self.key)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        SignalingConfig {
            host: "0.peerjs.com".to_string(),
            port: 443,
            path: "/".to_string(),
            key: "peerjs".to_string(),
            secure: true,
        }
    }
}

pub fn default_ice_servers() -> Vec<RTCIceServer> {
    ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302", "stun:stun2.l.google.com:19302", "stun:stun3.l.google.com:19302", "stun:stun4.l.google.com:19302"]
        .into_iter()
        .map(|url| RTCIceServer {
            urls: vec![url.to_string()],
            ..Default::default()
        })
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            signaling: SignalingConfig::default(),
            ice_servers: default_ice_servers(),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}
