use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// Metadata extracted from a validated committee share filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareFileMetadata {
    pub member_handle: String,
    pub allocation_name: String,
    pub filename: String,
}

/// `{operator_lower[2..10]}-{allocation_id}`
pub fn allocation_name(operator: &str, allocation_id: &str) -> EngineResult<String> {
    let operator = operator.trim();
    let hex_part = operator
        .strip_prefix("0x")
        .or_else(|| operator.strip_prefix("0X"))
        .filter(|rest| rest.len() == 40 && rest.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| {
            EngineError::InvalidInput(format!("invalid operator address '{operator}'"))
        })?;

    let allocation_id = allocation_id.trim();
    if allocation_id.is_empty() || allocation_id.contains(['-', '/', '\\']) {
        return Err(EngineError::InvalidInput(format!(
            "invalid allocation id '{allocation_id}'"
        )));
    }
    Ok(format!("{}-{allocation_id}", hex_part[..8].to_lowercase()))
}

pub fn share_filename(member_handle: &str, allocation_name: &str) -> String {
    format!("{member_handle}-{allocation_name}.bin")
}

/// Validates a committee share filename and extracts its parts.
///
/// Enforces:
/// - Format: `<member>-<operator prefix>-<allocation id>.bin`
/// - Operator prefix is 8 lowercase hex characters
/// - Ends in `.bin`
pub fn parse_share_filename(path: &str) -> EngineResult<ShareFileMetadata> {
    let path = Path::new(path);
    let filename = path
        .file_name()
        .ok_or_else(|| EngineError::InvalidInput("Missing share filename".into()))?
        .to_str()
        .ok_or_else(|| EngineError::InvalidInput("Invalid share filename encoding".into()))?;

    let stem = filename
        .strip_suffix(".bin")
        .ok_or_else(|| EngineError::InvalidInput("Share file must end with '.bin'".into()))?;

    let mut parts = stem.rsplitn(3, '-');
    let (Some(allocation_id), Some(operator_prefix), Some(member_handle)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(EngineError::InvalidInput(
            "Share filename must be '<member>-<operator>-<allocation>.bin'".into(),
        ));
    };

    if operator_prefix.len() != 8
        || !operator_prefix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(EngineError::InvalidInput(
            "Share filename operator prefix must be 8 lowercase hex characters".into(),
        ));
    }
    if member_handle.is_empty() || allocation_id.is_empty() {
        return Err(EngineError::InvalidInput("Share filename has empty parts".into()));
    }

    Ok(ShareFileMetadata {
        member_handle: member_handle.to_string(),
        allocation_name: format!("{operator_prefix}-{allocation_id}"),
        filename: filename.to_string(),
    })
}
