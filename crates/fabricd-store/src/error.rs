/// Error types for object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object row does not exist.
    #[error("object {0} not found")]
    ObjectNotFound(String),

    /// No FQN index entry for the given type and name.
    #[error("fq_name {fq_name} not found for type {type_name}")]
    FqNameNotFound {
        /// Resource type.
        type_name: String,
        /// Colon-joined fq_name.
        fq_name: String,
    },

    /// An FQN index entry already exists for the type and name.
    #[error("fq_name {fq_name} already exists for type {type_name}")]
    FqNameExists {
        /// Resource type.
        type_name: String,
        /// Colon-joined fq_name.
        fq_name: String,
    },

    /// A column value failed to parse as JSON.
    #[error("bad column value in {column}: {reason}")]
    BadColumn {
        /// Offending column name.
        column: String,
        /// Parse failure detail.
        reason: String,
    },

    /// A column name did not match the column grammar.
    #[error("unparsable column name: {0}")]
    BadColumnName(String),

    /// The requested list/map property element does not exist.
    #[error("prop collection entry {field}:{key} not found")]
    PropEntryNotFound {
        /// Property field name.
        field: String,
        /// List position or map key.
        key: String,
    },

    /// The backend table failed.
    #[error("object table error: {0}")]
    Backend(String),
}
