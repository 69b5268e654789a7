//! Компактное представление сигнала для ручной передачи (QR, копипаст):
//! JSON → gzip → base64.

use super::{SignalMessage, SignalingError};
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

// Ограничиваем размер распаковываемых данных до 256 KiB (защита от zip-bomb)
pub const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

pub fn encode(message: &SignalMessage) -> Result<String, SignalingError> {
    let json = serde_json::to_vec(message).map_err(|e| SignalingError::Encode(e.to_string()))?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)
        .map_err(|e| SignalingError::Encode(e.to_string()))?;
    let compressed = gz
        .finish()
        .map_err(|e| SignalingError::Encode(e.to_string()))?;
    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode(encoded: &str) -> Result<SignalMessage, SignalingError> {
    // 1. base64 -> bytes
    let compressed = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| SignalingError::Decode(e.to_string()))?;

    // 2. gunzip с ограничением размера
    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    gz.take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut json)
        .map_err(|e| SignalingError::Decode(e.to_string()))?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(SignalingError::TooLarge(MAX_DECOMPRESSED_SIZE));
    }

    // 3. JSON -> struct
    serde_json::from_slice(&json).map_err(|e| SignalingError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SessionDescription;
    use crate::signaling::SignalPayload;

    #[test]
    fn restores_the_same_message() {
        let sdp = "v=0\r\n".repeat(200);
        let msg = SignalMessage::new(
            "consult-7",
            "peer-a",
            SignalPayload::Answer(SessionDescription::answer(sdp)),
        );
        let encoded = encode(&msg).unwrap();
        assert!(encoded.len() < msg.to_json().unwrap().len());
        assert_eq!(decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(decode("not base64 !!"), Err(SignalingError::Decode(_))));
        let plain = general_purpose::STANDARD.encode(b"plain text, not gzip");
        assert!(matches!(decode(&plain), Err(SignalingError::Decode(_))));
    }

    #[test]
    fn rejects_oversized_payloads() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::best());
        gz.write_all(&vec![b' '; (MAX_DECOMPRESSED_SIZE + 10) as usize])
            .unwrap();
        let encoded = general_purpose::STANDARD.encode(gz.finish().unwrap());
        assert_eq!(
            decode(&encoded).unwrap_err(),
            SignalingError::TooLarge(MAX_DECOMPRESSED_SIZE)
        );
    }
}
