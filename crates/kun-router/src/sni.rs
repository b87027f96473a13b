//! TLS SNI extraction for passthrough routing

use crate::domain::normalize_domain;
use thiserror::Error;
use tracing::trace;

/// SNI extraction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("Not a TLS handshake record")]
    NotHandshake,

    #[error("Invalid SNI hostname: {0}")]
    InvalidSni(String),

    #[error("SNI extraction failed")]
    SniExtractionFailed,
}

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// Total length of the first TLS record once its header has arrived
pub fn record_len(buf: &[u8]) -> Result<Option<usize>, SniError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotHandshake);
    }
    if buf.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    Ok(Some(RECORD_HEADER_LEN + len))
}

fn read_u16(buf: &[u8], offset: usize) -> Result<usize, SniError> {
    if offset + 2 > buf.len() {
        return Err(SniError::SniExtractionFailed);
    }
    Ok(u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize)
}

/// Extract the server name from a TLS ClientHello record
pub fn extract_sni(client_hello: &[u8]) -> Result<String, SniError> {
    // Record header (5) + handshake header (4) + version (2) + random (32)
    if client_hello.len() < 43 {
        return Err(SniError::SniExtractionFailed);
    }
    if client_hello[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotHandshake);
    }
    if client_hello[RECORD_HEADER_LEN] != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::SniExtractionFailed);
    }

    let mut offset = 9 + 2 + 32;

    // Session ID
    if offset >= client_hello.len() {
        return Err(SniError::SniExtractionFailed);
    }
    let session_id_len = client_hello[offset] as usize;
    offset += 1 + session_id_len;

    // Cipher suites
    let cipher_suites_len = read_u16(client_hello, offset)?;
    offset += 2 + cipher_suites_len;

    // Compression methods
    if offset >= client_hello.len() {
        return Err(SniError::SniExtractionFailed);
    }
    let compression_methods_len = client_hello[offset] as usize;
    offset += 1 + compression_methods_len;

    // Extensions
    let extensions_len = read_u16(client_hello, offset)?;
    offset += 2;

    let extensions_end = offset + extensions_len;
    if extensions_end > client_hello.len() {
        return Err(SniError::SniExtractionFailed);
    }

    while offset + 4 <= extensions_end {
        let ext_type = read_u16(client_hello, offset)? as u16;
        let ext_len = read_u16(client_hello, offset + 2)?;
        offset += 4;

        if offset + ext_len > extensions_end {
            return Err(SniError::SniExtractionFailed);
        }

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(&client_hello[offset..offset + ext_len]);
        }

        offset += ext_len;
    }

    Err(SniError::SniExtractionFailed)
}

fn parse_server_name(data: &[u8]) -> Result<String, SniError> {
    if data.len() < 5 {
        return Err(SniError::SniExtractionFailed);
    }

    // Skip server_name_list length (2 bytes)
    let mut offset = 2;

    // name_type 0 = host_name
    if data[offset] != 0 {
        return Err(SniError::InvalidSni("Invalid name type".to_string()));
    }
    offset += 1;

    let name_len = read_u16(data, offset)?;
    offset += 2;

    if offset + name_len > data.len() {
        return Err(SniError::SniExtractionFailed);
    }

    let hostname = std::str::from_utf8(&data[offset..offset + name_len])
        .map_err(|_| SniError::InvalidSni("Invalid UTF-8 in hostname".to_string()))?;

    if hostname.is_empty() {
        return Err(SniError::InvalidSni("Empty hostname".to_string()));
    }

    trace!("Extracted SNI hostname: {}", hostname);
    Ok(normalize_domain(hostname))
}
