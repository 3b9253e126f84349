use crate::response::GraphQLError;

/// Fatal start-up problems with the configured gateway.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    /// The configuration file could not be read.
    #[error("reading configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid YAML for the expected shape.
    #[error("parsing configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// No subgraphs were configured.
    #[error("the subgraph list is empty")]
    EmptyRegistry,
    /// Two subgraphs share a name.
    #[error("duplicate subgraph name `{0}`")]
    DuplicateSubgraph(String),
    /// A subgraph entry is unusable.
    #[error("invalid subgraph `{name}`: {reason}")]
    InvalidSubgraph { name: String, reason: String },
    /// The header forwarding policy cannot be built.
    #[error("invalid header policy: {0}")]
    InvalidPolicy(String),
    /// Any other out-of-range setting.
    #[error("invalid setting `{setting}`: {reason}")]
    InvalidSetting {
        setting: &'static str,
        reason: String,
    },
}

/// Failure to obtain a schema document from one subgraph.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("timed out")]
    Timeout,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("subgraph returned errors: {0}")]
    GraphQL(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout
        } else if value.is_decode() {
            Self::Malformed(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

/// A composition attempt failed; the gateway keeps the previous schema.
#[derive(Debug, thiserror::Error)]
pub enum CompositionError {
    #[error("fetching schema of subgraph `{subgraph}`: {cause}")]
    Fetch {
        subgraph: String,
        #[source]
        cause: FetchError,
    },
    #[error("invalid schema from subgraph `{subgraph}`: {cause}")]
    InvalidSchema { subgraph: String, cause: String },
    #[error("subgraph `{subgraph}` conflicts with the composed schema: {cause}")]
    Conflict { subgraph: String, cause: String },
}

impl CompositionError {
    /// Name of the subgraph the failure is attributed to.
    pub fn subgraph(&self) -> &str {
        match self {
            Self::Fetch { subgraph, .. }
            | Self::InvalidSchema { subgraph, .. }
            | Self::Conflict { subgraph, .. } => subgraph,
        }
    }
}

/// Per-request failure to turn a query into an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("the document does not contain any operation")]
    NoOperation,
    #[error("unknown operation named `{0}`")]
    UnknownOperation(String),
    #[error("an operation name is required when the document contains multiple operations")]
    OperationNameRequired,
    #[error("unknown fragment `{0}`")]
    UnknownFragment(String),
    #[error("fragment `{0}` spreads itself")]
    FragmentCycle(String),
    #[error("unknown type `{0}`")]
    UnknownType(String),
    #[error("variable `${0}` is not defined by the operation")]
    UndefinedVariable(String),
    #[error("cannot query field `{field}` on type `{type_name}`")]
    UnknownField { type_name: String, field: String },
    #[error("field `{type_name}.{field}` {reason}")]
    InvalidSelection {
        type_name: String,
        field: String,
        reason: &'static str,
    },
    #[error("ownership of `{type_name}.{field}` is ambiguous between subgraphs {owners:?}")]
    AmbiguousOwnership {
        type_name: String,
        field: String,
        owners: Vec<String>,
    },
    #[error("field `{type_name}.{field}` cannot be reached from subgraph `{subgraph}`")]
    Unreachable {
        type_name: String,
        field: String,
        subgraph: String,
    },
    #[error("{0} operations are not supported")]
    Unsupported(&'static str),
}

/// Raised by the dispatcher when no step of a plan produced data.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("every subgraph request failed")]
    AllStepsFailed { errors: Vec<GraphQLError> },
}

/// Problems with a client multipart upload request.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid multipart request: {0}")]
    Multipart(#[from] multer::Error),
    #[error("missing `{0}` field in multipart request")]
    MissingField(&'static str),
    #[error("invalid `{field}` field: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("too many files: at most {0} allowed")]
    TooManyFiles(usize),
    #[error("file `{0}` exceeds the maximum upload size of {1} bytes")]
    FileTooLarge(String, u64),
    #[error("spooling upload: {0}")]
    Spool(#[from] std::io::Error),
    #[error("upload `{0}` was already forwarded to another subgraph")]
    AlreadyForwarded(String),
}

/// Request-level failure reported by the gateway engine.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no composed schema is available yet")]
    SchemaUnavailable,
    #[error("mutations cannot be executed from a GET request")]
    MutationNotAllowed,
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}
