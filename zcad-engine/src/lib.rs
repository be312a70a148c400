pub mod bake;
pub mod command;
pub mod convert;
pub mod dispatch;
pub mod display;
pub mod preview;
pub mod queue;
pub mod register;
pub mod responder;
pub mod session;
pub mod validate;

pub mod errors {
    use thiserror::Error;
    use zcad_core::transaction::DbError;
    use zcad_graph::{GraphError, GraphId};

    /// 实体被拒绝保留到事务之外的原因。
    #[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
    pub enum Rejection {
        #[error("already disposed")]
        Disposed,
        #[error("still resident in the database as object {0}")]
        DatabaseResident(u64),
        #[error("geometry is not fully realized")]
        Unrealized,
    }

    #[derive(Debug, Error, Clone, PartialEq, Eq)]
    #[error("transient entity {key} ({kind}) rejected: {reason}")]
    pub struct ValidationError {
        pub key: u64,
        pub kind: &'static str,
        pub reason: Rejection,
    }

    #[derive(Debug, Error, Clone, PartialEq)]
    pub enum ConversionError {
        #[error("{0} geometry is not supported by this converter")]
        Unsupported(&'static str),
        #[error("mesh is not closed and cannot become a solid")]
        NotClosed,
        #[error("invalid geometry: {0}")]
        Invalid(String),
    }

    #[derive(Debug, Error)]
    pub enum PreviewError {
        #[error("conversion of {id} failed: {source}")]
        Conversion {
            id: String,
            #[source]
            source: ConversionError,
        },
        #[error(transparent)]
        Validation(#[from] ValidationError),
    }

    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum QueueError {
        #[error("conversion queue is already draining")]
        Reentrant,
    }

    #[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
    #[error("main-thread session has shut down")]
    pub struct SessionClosed;

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("graph document {0} is not open")]
        UnknownGraph(GraphId),
        #[error(transparent)]
        Database(#[from] DbError),
        #[error(transparent)]
        Conversion(#[from] ConversionError),
        #[error(transparent)]
        Preview(#[from] PreviewError),
        #[error(transparent)]
        Queue(#[from] QueueError),
        #[error(transparent)]
        Graph(#[from] GraphError),
    }
}
