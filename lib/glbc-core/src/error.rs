use glbc_cloud::CloudError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Loadbalancer {0} not in pool")]
    LoadBalancerNotFound(String),

    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("NEG syncer error: {0}")]
    Syncer(String),

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errs: &[Error]) -> String {
    let msgs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
    format!("[{}]", msgs.join(", "))
}

impl Error {
    /// Collapse a list of errors: None when empty, the error itself when
    /// there is one, an aggregate otherwise.
    pub fn aggregate(mut errs: Vec<Error>) -> Option<Error> {
        match errs.len() {
            0 => None,
            1 => errs.pop(),
            _ => Some(Error::Aggregate(errs)),
        }
    }

    /// Like `aggregate`, as a Result.
    pub fn from_list(errs: Vec<Error>) -> Result<()> {
        match Self::aggregate(errs) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Cloud(e) => e.is_not_found(),
            Error::Aggregate(errs) => errs.len() == 1 && errs[0].is_not_found(),
            _ => false,
        }
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, Error::Cloud(e) if e.is_in_use())
    }

    /// The underlying cloud error, if any.
    pub fn as_cloud(&self) -> Option<&CloudError> {
        match self {
            Error::Cloud(e) => Some(e),
            _ => None,
        }
    }
}
