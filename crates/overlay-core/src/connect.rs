//! HTTP CONNECT wire helper (§6, §8 scenario 4/5). Grounded on
//! `original_source/request/http.go`'s `HttpConnect`: write the request
//! line plus a `Host` header (unless already supplied) and a blank
//! line, then read the status line and drain headers up to the blank
//! line that terminates them.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{OverlayError, OverlayResult};

async fn read_line<S: AsyncRead + Unpin>(conn: &mut S) -> OverlayResult<String> {
    let mut line = Vec::new();
    loop {
        let byte = conn
            .read_u8()
            .await
            .map_err(|e| OverlayError::MalformedConnect(e.to_string()))?;
        if byte == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            break;
        }
        line.push(byte);
    }
    String::from_utf8(line).map_err(|e| OverlayError::MalformedConnect(e.to_string()))
}

/// Issue an HTTP CONNECT over `conn` and wait for the `200` response.
/// `extra_headers` are written verbatim after the request line; a
/// `Host` header is synthesized from `host` unless one is already
/// present (case-insensitively) among them.
pub async fn http_connect<S>(
    conn: &mut S,
    host: &str,
    extra_headers: Option<&[(String, String)]>,
) -> OverlayResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {host} HTTP/1.1\r\n");

    let has_host_header = extra_headers
        .map(|headers| headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")))
        .unwrap_or(false);
    if !has_host_header {
        request.push_str(&format!("Host: {host}\r\n"));
    }
    if let Some(headers) = extra_headers {
        for (key, value) in headers {
            request.push_str(&format!("{key}: {value}\r\n"));
        }
    }
    request.push_str("\r\n");

    conn.write_all(request.as_bytes()).await?;
    conn.flush().await?;

    let status_line = read_line(conn).await?;
    let mut parts = status_line.splitn(3, ' ');
    let _http_version = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OverlayError::MalformedConnect(format!("malformed HTTP response {status_line:?}")))?;
    let status_code = parts
        .next()
        .ok_or_else(|| OverlayError::MalformedConnect(format!("malformed HTTP response {status_line:?}")))?;
    if status_code.len() != 3 {
        return Err(OverlayError::MalformedConnect(format!(
            "malformed HTTP status code {status_code:?}"
        )));
    }

    loop {
        let header_line = read_line(conn).await?;
        if header_line.is_empty() {
            break;
        }
    }

    if status_code != "200" {
        return Err(OverlayError::ConnectNonOk(status_code.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn happy_path_writes_exact_bytes_and_succeeds() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let connect = tokio::spawn(async move { http_connect(&mut client, "host:443", None).await });

        let mut request = Vec::new();
        loop {
            let mut buf = [0u8; 1];
            server.read_exact(&mut buf).await.unwrap();
            request.push(buf[0]);
            if request.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        assert_eq!(
            request,
            b"CONNECT host:443 HTTP/1.1\r\nHost: host:443\r\n\r\n".to_vec()
        );

        server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        connect.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn non_200_status_is_reported_verbatim() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let connect = tokio::spawn(async move { http_connect(&mut client, "host:443", None).await });

        let mut request = Vec::new();
        loop {
            let mut buf = [0u8; 1];
            server.read_exact(&mut buf).await.unwrap();
            request.push(buf[0]);
            if request.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        server
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();

        let err = connect.await.unwrap().unwrap_err();
        match err {
            OverlayError::ConnectNonOk(code) => assert_eq!(code, "407"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
