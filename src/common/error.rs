use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboundError {
    #[error("outbound tag must not be empty")]
    EmptyTag,

    #[error("outbound type not found: {0}")]
    UnknownType(String),

    #[error("outbound not found: {0}")]
    NotFound(String),

    #[error("outbound[{tag}] is depended by {}", dependents.join(", "))]
    DependedBy { tag: String, dependents: Vec<String> },

    #[error("circular outbound dependency: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("dependency[{dependency}] not found for outbound[{outbound}]")]
    MissingDependency { dependency: String, outbound: String },

    #[error("missing tags")]
    MissingTags,

    #[error("outbound {index} not found: {tag}")]
    MemberNotFound { index: usize, tag: String },

    #[error("default outbound not found: {0}")]
    DefaultNotFound(String),

    #[error("no available outbounds (all disabled or weight=0)")]
    NoEnabledMembers,

    #[error("missing supported outbound")]
    MissingSupportedOutbound,

    #[error("no available outbound")]
    NoAvailableOutbound,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("outbound manager already started at stage {0}")]
    AlreadyStarted(String),

    #[error("connection interrupted by outbound group")]
    Interrupted,
}

impl OutboundError {
    pub fn kind(&self) -> OutboundErrorKind {
        match self {
            OutboundError::EmptyTag
            | OutboundError::UnknownType(_)
            | OutboundError::MissingTags
            | OutboundError::MemberNotFound { .. }
            | OutboundError::DefaultNotFound(_)
            | OutboundError::NoEnabledMembers
            | OutboundError::InvalidOption(_) => OutboundErrorKind::Config,
            OutboundError::CircularDependency { .. } | OutboundError::MissingDependency { .. } => {
                OutboundErrorKind::Dependency
            }
            OutboundError::NotFound(_)
            | OutboundError::DependedBy { .. }
            | OutboundError::AlreadyStarted(_) => OutboundErrorKind::Constraint,
            OutboundError::MissingSupportedOutbound
            | OutboundError::NoAvailableOutbound
            | OutboundError::Unsupported(_)
            | OutboundError::Interrupted => OutboundErrorKind::Runtime,
        }
    }

    /// Try to find an OutboundError anywhere in an anyhow chain.
    pub fn find(err: &anyhow::Error) -> Option<&OutboundError> {
        err.chain().find_map(|e| e.downcast_ref::<OutboundError>())
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundErrorKind {
    /// 配置错误：只影响当前 create / start 调用
    Config,
    /// 依赖错误：整个启动失败
    Dependency,
    /// 约束错误：调用方可以修正后重试
    Constraint,
    /// 运行期错误：拨号失败等
    Runtime,
}

impl OutboundErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, OutboundErrorKind::Constraint | OutboundErrorKind::Runtime)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutboundErrorKind::Config => "CONFIG",
            OutboundErrorKind::Dependency => "DEPENDENCY",
            OutboundErrorKind::Constraint => "CONSTRAINT",
            OutboundErrorKind::Runtime => "RUNTIME",
        }
    }
}

impl From<OutboundError> for std::io::Error {
    fn from(e: OutboundError) -> Self {
        match e {
            OutboundError::Interrupted => {
                std::io::Error::new(std::io::ErrorKind::ConnectionAborted, e.to_string())
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}
