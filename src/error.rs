use crate::substrate::SubstrateError;
use thiserror::Error;

/// Errors raised by the load-generation engine
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not open {role} connection #{index}: {source}")]
    Connection {
        role: &'static str,
        index: usize,
        #[source]
        source: SubstrateError,
    },

    #[error("could not provision partition '{partition}': {source}")]
    Provision {
        partition: String,
        #[source]
        source: SubstrateError,
    },

    #[error("could not start worker {id}: {source}")]
    WorkerStart {
        id: String,
        #[source]
        source: SubstrateError,
    },

    #[error("worker {0} was already stopped")]
    WorkerStopped(String),
}
