use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimDbError {
    #[error("Entity not found: {index}v{generation}")]
    EntityNotFound { index: u32, generation: u32 },

    #[error("Component type not registered: {0}")]
    UnregisteredComponent(&'static str),

    #[error("Component not found for entity {entity_index}: {component_type}")]
    ComponentNotFound {
        entity_index: u32,
        component_type: &'static str,
    },

    #[error("Component type id space exhausted (max 256 types)")]
    TypeSpaceExhausted,

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Clone failed while syncing chunk {chunk_index} of {component_type}")]
    CloneFailed {
        component_type: String,
        chunk_index: u32,
    },

    #[error("Sync mask mismatch: {0}")]
    SyncMaskMismatch(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, SimDbError>;
