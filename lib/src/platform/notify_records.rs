use thiserror::Error;
use widestring::U16String;

// values of FILE_ACTION_* from winnt.h
const FILE_ACTION_ADDED: u32 = 1;
const FILE_ACTION_REMOVED: u32 = 2;
const FILE_ACTION_MODIFIED: u32 = 3;
const FILE_ACTION_RENAMED_OLD_NAME: u32 = 4;
const FILE_ACTION_RENAMED_NEW_NAME: u32 = 5;

/// NextEntryOffset, Action and FileNameLength, each one DWORD
const HEADER_LEN: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyAction {
    Added,
    Removed,
    Modified,
    RenamedOldName,
    RenamedNewName,
    Other(u32),
}

impl NotifyAction {
    pub fn from_raw(action: u32) -> Self {
        match action {
            FILE_ACTION_ADDED => NotifyAction::Added,
            FILE_ACTION_REMOVED => NotifyAction::Removed,
            FILE_ACTION_MODIFIED => NotifyAction::Modified,
            FILE_ACTION_RENAMED_OLD_NAME => NotifyAction::RenamedOldName,
            FILE_ACTION_RENAMED_NEW_NAME => NotifyAction::RenamedNewName,
            other => NotifyAction::Other(other),
        }
    }
}

/// Decoded `FILE_NOTIFY_INFORMATION` entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyRecord {
    pub action: NotifyAction,
    /// Name relative to watched directory
    pub name: U16String,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("notification record at offset {0} is truncated")]
    Truncated(usize),
    #[error("notification record at offset {0} is not dword aligned")]
    Misaligned(usize),
}

/// Decodes sequence of `FILE_NOTIFY_INFORMATION` structures
///
/// Buffer layout of each record:
/// first DWORD holds offset to the next record (in bytes!), zero for last record
/// second DWORD holds Action
/// third DWORD holds filename length (in bytes)
/// then wchar buffer of filename length (without null terminating char)
pub fn decode_records(bytes: &[u8]) -> Result<Vec<NotifyRecord>, DecodeError> {
    let mut records = vec![];
    if bytes.is_empty() {
        return Ok(records);
    }

    let mut offset = 0;
    loop {
        let header = bytes
            .get(offset..offset + HEADER_LEN)
            .ok_or(DecodeError::Truncated(offset))?;
        let next = read_dword(header, 0) as usize;
        let action = read_dword(header, 4);
        let name_len = read_dword(header, 8) as usize;

        let name_start = offset + HEADER_LEN;
        let name = bytes
            .get(name_start..name_start + name_len)
            .ok_or(DecodeError::Truncated(offset))?;
        let name: Vec<u16> = name
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect();

        records.push(NotifyRecord {
            action: NotifyAction::from_raw(action),
            name: U16String::from_vec(name),
        });

        if next == 0 {
            break;
        }
        if next % 4 != 0 {
            return Err(DecodeError::Misaligned(offset));
        }
        offset += next;
    }

    Ok(records)
}

fn read_dword(bytes: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Builds buffer in the same layout as `ReadDirectoryChangesW` does
#[cfg(test)]
pub(crate) fn encode_records(records: &[(u32, &str)]) -> Vec<u8> {
    let mut buffer = vec![];
    for (i, (action, name)) in records.iter().enumerate() {
        let name: Vec<u16> = name.encode_utf16().collect();
        let name_len = name.len() * 2;
        // each record is padded to dword boundary
        let record_len = (HEADER_LEN + name_len + 3) / 4 * 4;
        let next = if i + 1 == records.len() { 0 } else { record_len };

        buffer.extend_from_slice(&(next as u32).to_ne_bytes());
        buffer.extend_from_slice(&action.to_ne_bytes());
        buffer.extend_from_slice(&(name_len as u32).to_ne_bytes());
        for unit in name {
            buffer.extend_from_slice(&unit.to_ne_bytes());
        }
        buffer.resize(buffer.len() + record_len - HEADER_LEN - name_len, 0);
    }
    buffer
}
