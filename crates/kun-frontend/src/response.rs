use crate::FrontendError;

/// A complete `Connection: close` response describing `error`, if it has a status
pub fn error_response(error: &FrontendError) -> Option<Vec<u8>> {
    let (code, reason) = error.status()?;
    let body = format!("{}\n", error);
    Some(
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            code,
            reason,
            body.len(),
            body
        )
        .into_bytes(),
    )
}
