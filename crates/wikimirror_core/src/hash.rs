use sha2::{Digest, Sha256};

use crate::ast::Document;
use crate::error::ConversionError;

/// Content address of a document: hex SHA-256 over its JSON serialization.
///
/// Field order is fixed by the type definitions and the AST holds no maps, so
/// equal trees always serialize to equal bytes.
pub fn hash_document(document: &Document) -> Result<String, ConversionError> {
    let canonical = serde_json::to_string(document)
        .map_err(|error| ConversionError::Serialize(error.to_string()))?;
    Ok(hash_canonical_text(&canonical))
}

pub fn hash_canonical_text(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
