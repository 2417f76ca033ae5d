use base64::Engine;
use bytes::Bytes;

pub fn encode(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Splits a base64 `data:` URL into its mime type and decoded bytes.
/// Returns `None` for anything else, including malformed payloads.
pub fn decode(url: &str) -> Option<(String, Bytes)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    let raw = base64::engine::general_purpose::STANDARD.decode(payload.trim()).ok()?;
    Some((mime.to_string(), Bytes::from(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_what_it_encodes() {
        let url = encode("image/png", b"\x89PNG");
        let (mime, bytes) = decode(&url).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(&bytes[..], b"\x89PNG");
    }

    #[test]
    fn rejects_plain_urls_and_non_base64() {
        assert!(decode("https://cdn.example.com/a.png").is_none());
        assert!(decode("data:text/plain,hello").is_none());
    }
}
