//! Error types for directive compilation

use thiserror::Error;

/// Main error type for k8sboot compilation
///
/// Every error is fatal to a run: the remaining directives are skipped and
/// documents already handed to the sink stay where they are.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A second `ns` directive in the same run
    #[error("namespace already set to '{existing}', refusing to switch to '{requested}'")]
    DuplicateNamespace {
        /// Namespace set by the first directive
        existing: String,
        /// Namespace requested by the rejected directive
        requested: String,
    },

    /// An option argument had the wrong shape or value
    #[error("invalid option for '{directive}': {message}")]
    InvalidOption {
        /// Directive (or option) being compiled
        directive: String,
        /// What was wrong
        message: String,
    },

    /// Volume mount with a scheme we cannot map to a volume source
    #[error("unsupported volume protocol '{0}'")]
    UnsupportedVolumeProtocol(String),

    /// Port declaration that is not `[scheme://]int[:int[:int]]`
    #[error("malformed port '{input}': {reason}")]
    MalformedPort {
        /// Raw declaration
        input: String,
        /// What was wrong
        reason: String,
    },

    /// Volume mount declaration that could not be tokenized
    #[error("malformed volume mount '{input}': {reason}")]
    MalformedMount {
        /// Raw declaration
        input: String,
        /// What was wrong
        reason: String,
    },

    /// Probe or lifecycle handler that could not be parsed
    #[error("malformed probe '{input}': {reason}")]
    MalformedProbe {
        /// Raw declaration
        input: String,
        /// What was wrong
        reason: String,
    },

    /// Selector, affinity, toleration or host alias expression error
    #[error("malformed expression '{input}': {reason}")]
    MalformedExpression {
        /// Raw expression
        input: String,
        /// What was wrong
        reason: String,
    },

    /// Directive name not present in the directive table
    #[error("unknown directive '{0}'")]
    UnknownDirective(String),

    /// App-scoped directive used outside of an `app` block
    #[error("directive '{0}' must be nested under an app")]
    NoAppScope(String),

    /// `${name}` reference with no binding
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    /// Ingress backend that maps to no known service
    #[error("no service backs app '{app}' on port {port}")]
    UnresolvedBackend {
        /// Target application
        app: String,
        /// Requested port (0 when the app had no ports at all)
        port: u16,
    },

    /// Filesystem error while reading inputs or writing documents
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Two documents of one run map to the same output file
    #[error("output file '{}' already written in this run", .0.display())]
    DuplicateOutput(std::path::PathBuf),

    /// YAML parse or render error
    #[error("yaml error: {0}")]
    Yaml(String),

    /// JSON conversion error on an argument tree
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid option error
    pub fn invalid_option(directive: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            directive: directive.into(),
            message: message.into(),
        }
    }

    /// Create a malformed port error
    pub fn malformed_port(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPort {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed mount error
    pub fn malformed_mount(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedMount {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed probe error
    pub fn malformed_probe(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedProbe {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed expression error
    pub fn malformed_expression(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedExpression {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a yaml error with the given message
    pub fn yaml(msg: impl Into<String>) -> Self {
        Self::Yaml(msg.into())
    }

    /// Whether the error stems from a dangling cross-reference rather than
    /// from the shape of a single directive
    pub fn is_referential(&self) -> bool {
        matches!(self, Self::UnresolvedBackend { .. })
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml(err.to_string())
    }
}
