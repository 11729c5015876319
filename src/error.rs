use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("entity `{entity}` uses an embedded identifier, which is not supported")]
    UnsupportedIdentifier { entity: String },
    #[error("contract violation: {0}")]
    ContractViolation(String),
    #[error("no `{entity}` entity found with id {id}")]
    EntityNotFound { entity: String, id: String },
    #[error("entity `{entity}` has no property `{property}`")]
    UnknownProperty { entity: String, property: String },
    #[error("transaction error: {0}")]
    TransactionState(&'static str),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("query error: {context}")]
    QueryError { query: String, context: String },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn contract(msg: impl Into<String>) -> Self {
        Error::ContractViolation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
