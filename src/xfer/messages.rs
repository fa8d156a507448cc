use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

// TALK record wire format: a sequence of `(tag u8, length varint, value)` fields in
//  ascending tag order. All fields are required; unknown tags are rejected.
fn put_field(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_usize_varint(value.len());
    buf.put_slice(value);
}

fn get_field<'a>(buf: &mut &'a [u8], expected_tag: u8) -> anyhow::Result<&'a [u8]> {
    let tag = buf.try_get_u8()?;
    if tag != expected_tag {
        bail!("expected field tag {}, got {}", expected_tag, tag);
    }
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("truncated field {}", expected_tag);
    }
    let (value, rest) = buf.split_at(len);
    *buf = rest;
    Ok(value)
}

fn finish(buf: &[u8]) -> anyhow::Result<()> {
    if !buf.is_empty() {
        bail!("trailing bytes after record");
    }
    Ok(())
}

fn get_u16_field(buf: &mut &[u8], tag: u8) -> anyhow::Result<u16> {
    let value = get_field(buf, tag)?;
    if value.len() != 2 {
        bail!("field {} must be 2 bytes", tag);
    }
    Ok(u16::from_be_bytes(value.try_into().expect("2 byte slice")))
}

fn get_u64_field(buf: &mut &[u8], tag: u8) -> anyhow::Result<u64> {
    let value = get_field(buf, tag)?;
    if value.len() != 8 {
        bail!("field {} must be 8 bytes", tag);
    }
    Ok(u64::from_be_bytes(value.try_into().expect("8 byte slice")))
}

fn get_bool_field(buf: &mut &[u8], tag: u8) -> anyhow::Result<bool> {
    let value = get_field(buf, tag)?;
    match value {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => bail!("field {} must be a single 0/1 byte", tag),
    }
}

fn get_secret_field(buf: &mut &[u8], tag: u8) -> anyhow::Result<[u8; 16]> {
    let value = get_field(buf, tag)?;
    if value.len() != 16 {
        bail!("field {} must be 16 bytes", tag);
    }
    Ok(value.try_into().expect("16 byte slice"))
}

/// Sent by the downloader to ask for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XferInitRequest {
    pub id: u16,
    pub filename: String,
}

impl XferInitRequest {
    pub fn ser(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, 1, &self.id.to_be_bytes());
        put_field(&mut buf, 2, self.filename.as_bytes());
        buf.to_vec()
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<XferInitRequest> {
        let id = get_u16_field(&mut buf, 1)?;
        let filename = String::from_utf8(get_field(&mut buf, 2)?.to_vec())?;
        finish(buf)?;
        Ok(XferInitRequest { id, filename })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XferInitResponse {
    pub ok: bool,
}

impl XferInitResponse {
    pub fn ser(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, 1, &[self.ok as u8]);
        buf.to_vec()
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<XferInitResponse> {
        let ok = get_bool_field(&mut buf, 1)?;
        finish(buf)?;
        Ok(XferInitResponse { ok })
    }
}

/// Sent by the server back to the downloader to establish the session and announce the
///  file size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XferStartRequest {
    pub id: u16,
    pub initiator_secret: [u8; 16],
    pub file_size: u64,
}

impl XferStartRequest {
    pub fn ser(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, 1, &self.id.to_be_bytes());
        put_field(&mut buf, 2, &self.initiator_secret);
        put_field(&mut buf, 3, &self.file_size.to_be_bytes());
        buf.to_vec()
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<XferStartRequest> {
        let id = get_u16_field(&mut buf, 1)?;
        let initiator_secret = get_secret_field(&mut buf, 2)?;
        let file_size = get_u64_field(&mut buf, 3)?;
        finish(buf)?;
        Ok(XferStartRequest {
            id,
            initiator_secret,
            file_size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XferStartResponse {
    pub ok: bool,
    pub recipient_secret: [u8; 16],
}

impl XferStartResponse {
    pub fn ser(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, 1, &[self.ok as u8]);
        put_field(&mut buf, 2, &self.recipient_secret);
        buf.to_vec()
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<XferStartResponse> {
        let ok = get_bool_field(&mut buf, 1)?;
        let recipient_secret = get_secret_field(&mut buf, 2)?;
        finish(buf)?;
        Ok(XferStartResponse {
            ok,
            recipient_secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_init_request_roundtrip() {
        let original = XferInitRequest {
            id: 0xbeef,
            filename: "some/dir/file.bin".to_string(),
        };
        let decoded = XferInitRequest::deser(&original.ser()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_start_roundtrip() {
        let request = XferStartRequest {
            id: 3,
            initiator_secret: [7u8; 16],
            file_size: u64::MAX,
        };
        assert_eq!(XferStartRequest::deser(&request.ser()).unwrap(), request);

        let response = XferStartResponse {
            ok: true,
            recipient_secret: [9u8; 16],
        };
        assert_eq!(XferStartResponse::deser(&response.ser()).unwrap(), response);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::wrong_tag(vec![9, 2, 0, 1])]
    #[case::truncated_value(vec![1, 2, 0])]
    #[case::bad_utf8(XferInitRequest { id: 1, filename: "x".into() }.ser().into_iter().map(|b| if b == b'x' { 0xff } else { b }).collect())]
    fn test_init_request_rejects(#[case] raw: Vec<u8>) {
        assert!(XferInitRequest::deser(&raw).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut raw = XferInitResponse { ok: true }.ser();
        raw.push(0);
        assert!(XferInitResponse::deser(&raw).is_err());
    }

    #[test]
    fn test_bad_bool_rejected() {
        let raw = vec![1, 1, 2]; // tag 1, len 1, value 2
        assert!(XferInitResponse::deser(&raw).is_err());
    }
}
