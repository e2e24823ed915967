use super::{ObisCode, GET_REQUEST_LEN, HEADER_LEN};
use crate::error::CodecError;

/// Get-Request, normal
const GET_REQUEST_HEADER: [u8; HEADER_LEN] = [0xC0, 0x01];

/// Build the Get-Request frame asking for the data point identified by `obis`.
pub fn encode_get_request(obis: &[u8]) -> Result<[u8; GET_REQUEST_LEN], CodecError> {
    let obis = ObisCode::try_from(obis)?;
    Ok(obis.get_request())
}

impl ObisCode {
    /// The Get-Request frame for this code.
    pub fn get_request(&self) -> [u8; GET_REQUEST_LEN] {
        let mut frame = [0u8; GET_REQUEST_LEN];
        frame[..HEADER_LEN].copy_from_slice(&GET_REQUEST_HEADER);
        frame[HEADER_LEN..].copy_from_slice(self.as_bytes());
        frame
    }
}

#[test]
fn test_encode_get_request() {
    let obis = [0x01, 0x00, 0x01, 0x08, 0x00, 0xFF];
    let frame = encode_get_request(&obis).unwrap();
    assert_eq!(hex::encode(frame), "c0010100010800ff");
}

#[test]
fn test_encode_get_request_keeps_obis_verbatim() {
    for obis in [[0u8; 6], [0xFF; 6], [0x00, 0x00, 0x60, 0x06, 0x03, 0xFF], [1, 2, 3, 4, 5, 6]] {
        let frame = encode_get_request(&obis).unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(frame[2..], obis);
    }
}

#[test]
fn test_encode_get_request_rejects_bad_length() {
    assert_eq!(encode_get_request(&[]), Err(CodecError::InvalidObisCode(0)));
    assert_eq!(encode_get_request(&[0; 5]), Err(CodecError::InvalidObisCode(5)));
    assert_eq!(encode_get_request(&[0; 7]), Err(CodecError::InvalidObisCode(7)));
}
