//! Error handling for the Rivet PBX core


pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("SIP error: {0}")]
    Sip(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Alarm system error: {0}")]
    Alarm(String),

    #[error("Call error: {0}")]
    Call(String),

    #[error("Feature hook error: {0}")]
    Feature(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn sip<S: Into<String>>(msg: S) -> Self {
        Self::Sip(msg.into())
    }

    pub fn sdp<S: Into<String>>(msg: S) -> Self {
        Self::Sdp(msg.into())
    }

    pub fn rtp<S: Into<String>>(msg: S) -> Self {
        Self::Rtp(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::Auth(msg.into())
    }

    pub fn registration<S: Into<String>>(msg: S) -> Self {
        Self::Registration(msg.into())
    }

    pub fn provisioning<S: Into<String>>(msg: S) -> Self {
        Self::Provisioning(msg.into())
    }

    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn call<S: Into<String>>(msg: S) -> Self {
        Self::Call(msg.into())
    }

    pub fn feature<S: Into<String>>(msg: S) -> Self {
        Self::Feature(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}
